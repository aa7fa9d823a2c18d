use anyhow::{Context, Result};
use ignore::overrides::{Override, OverrideBuilder};
use ignore::WalkBuilder;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Built-in source extensions Satori indexes by default, independent of any
/// `customExtensions` a caller supplies (spec §4.A).
const DEFAULT_CODE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "py", "go", "java", "c", "h", "cpp", "hpp", "cc", "rb", "php",
    "cs", "swift", "kt", "md",
];

/// Per-file SHA-256 mapping plus the order-independent Merkle root (spec §3).
#[derive(Debug, Clone, Default)]
pub struct MerkleIndex {
    pub entries: BTreeMap<String, String>,
}

impl MerkleIndex {
    pub fn root(&self) -> String {
        compute_merkle_root(&self.entries)
    }
}

/// Root = SHA-256 over entries sorted lexicographically by path, each
/// emitted as `path \0 hash \n` before the final digest (spec §3).
///
/// Order-independent: a `BTreeMap` already iterates in sorted key order, so
/// permuting the *insertion* order of `entries` never changes the result
/// (P2).
pub fn compute_merkle_root(entries: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    for (path, hash) in entries {
        hasher.update(path.as_bytes());
        hasher.update(b"\0");
        hasher.update(hash.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// `Leaf = SHA-256 of "path \0 hash"` (spec §3) — a distinct value from the
/// root, useful for verifying a single entry without recomputing the whole
/// tree.
pub fn leaf_hash(path: &str, hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(b"\0");
    hasher.update(hash.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Thin hex module so we don't need an extra crate dependency just for
/// lower-case hex encoding of digest bytes.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        use std::fmt::Write;
        let mut out = String::with_capacity(bytes.as_ref().len() * 2);
        for byte in bytes.as_ref() {
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

fn built_in_overrides(repo_root: &Path, custom_extensions: &[String]) -> Result<Override> {
    let mut ob = OverrideBuilder::new(repo_root);
    for ext in DEFAULT_CODE_EXTENSIONS {
        ob.add(&format!("**/*.{ext}"))?;
    }
    for ext in custom_extensions {
        let ext = ext.trim_start_matches('.');
        ob.add(&format!("**/*.{ext}"))?;
    }
    Ok(ob.build()?)
}

/// Options controlling a single Merkle walk (spec §4.A).
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    pub custom_extensions: Vec<String>,
    /// Extra ignore patterns from `create(..., ignorePatterns)`, applied
    /// after built-ins and `.satoriignore`; negated entries (`!pattern`)
    /// re-include previously excluded paths.
    pub ignore_patterns: Vec<String>,
}

/// Walks `repo_root`, filters via built-in extensions, `.satoriignore`, and
/// caller-supplied `ignorePatterns` (negation supported), then computes a
/// per-file SHA-256 for every surviving file. Paths are normalized to forward
/// slashes, relative to `repo_root` (spec §4.A).
pub fn build_merkle_index(repo_root: &Path, options: &WalkOptions) -> Result<MerkleIndex> {
    let overrides = built_in_overrides(repo_root, &options.custom_extensions)?;

    let mut walker = WalkBuilder::new(repo_root);
    walker
        .standard_filters(true)
        .add_custom_ignore_filename(".satoriignore")
        .overrides(overrides);

    let mut entries = BTreeMap::new();
    for item in walker.build() {
        let dent = match item {
            Ok(d) => d,
            Err(_) => continue,
        };
        if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        let abs_path = dent.path();
        let rel_path = relativize(abs_path, repo_root)?;

        if !matches_extra_ignore_patterns(&rel_path, &options.ignore_patterns) {
            continue;
        }

        let bytes = std::fs::read(abs_path)
            .with_context(|| format!("failed to read {}", abs_path.display()))?;
        entries.insert(rel_path, sha256_hex(&bytes));
    }

    Ok(MerkleIndex { entries })
}

/// Applies an ordered list of glob-ish patterns with `!`-negation support:
/// later patterns win, mirroring `.gitignore` semantics. Returns `true` if
/// the path survives (should be included).
fn matches_extra_ignore_patterns(rel_path: &str, patterns: &[String]) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let mut included = true;
    for pattern in patterns {
        let (negate, glob_pat) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern.as_str()),
        };
        if glob_match(glob_pat, rel_path) {
            included = negate;
        }
    }
    included
}

/// Minimal glob matcher supporting `*` (any run of non-slash chars) and `**`
/// (any run of chars including slashes), sufficient for ignore-pattern style
/// rules without pulling in a dedicated glob crate purely for this.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn helper(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) if p.get(1) == Some(&b'*') => {
                // `**` — try consuming zero or more chars of t.
                for i in 0..=t.len() {
                    if helper(&p[2..], &t[i..]) {
                        return true;
                    }
                }
                false
            }
            (Some(b'*'), _) => {
                for i in 0..=t.iter().take_while(|&&c| c != b'/').count().min(t.len()) {
                    if helper(&p[1..], &t[i..]) {
                        return true;
                    }
                }
                false
            }
            (Some(pc), Some(tc)) if pc == tc => helper(&p[1..], &t[1..]),
            _ => false,
        }
    }
    helper(pattern.as_bytes(), text.as_bytes())
}

fn relativize(path: &Path, base: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(base)
        .with_context(|| format!("{} is not under {}", path.display(), base.display()))?;
    Ok(rel.to_string_lossy().replace('\\', "/"))
}

/// Canonicalizes a codebase path: resolves symlinks, normalizes separators,
/// strips trailing separators (spec §3 "Codebase path").
pub fn canonicalize_codebase_path(path: &Path) -> Result<PathBuf> {
    let canon = path
        .canonicalize()
        .with_context(|| format!("codebase path does not exist: {}", path.display()))?;
    Ok(canon)
}

/// Where the persisted Merkle map for a codebase lives, so
/// `reindexByChange` (spec §4.E) has something to diff the freshly-walked
/// tree against. Mirrors `callgraph::sidecar_path`'s md5-of-canonical-path
/// naming scheme.
pub fn merkle_sidecar_path(context_dir: &Path, codebase_path: &Path) -> PathBuf {
    let digest = md5::compute(codebase_path.to_string_lossy().as_bytes());
    context_dir.join("merkle").join(format!("{digest:x}.json"))
}

/// Writes the persisted Merkle map atomically: temp-file + rename, same
/// pattern as `callgraph::write_sidecar_atomic`.
pub fn write_merkle_index_atomic(path: &Path, index: &MerkleIndex) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let serialized = serde_json::to_vec_pretty(&index.entries)?;
    std::fs::write(&tmp, &serialized).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("failed to finalize {}", path.display()))?;
    Ok(())
}

/// Loads a previously persisted Merkle map, or an empty one if none exists
/// yet (the first `sync` against a codebase that predates this file treats
/// every surviving path as `added`).
pub fn load_merkle_index(path: &Path) -> Result<MerkleIndex> {
    if !path.exists() {
        return Ok(MerkleIndex::default());
    }
    let raw = std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let entries: BTreeMap<String, String> = serde_json::from_str(&raw)?;
    Ok(MerkleIndex { entries })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn merkle_root_is_stable_for_fixed_input() {
        let mut a = BTreeMap::new();
        a.insert("src/lib.rs".to_string(), sha256_hex(b"fn main() {}"));
        a.insert("src/main.rs".to_string(), sha256_hex(b"mod lib;"));
        let root1 = compute_merkle_root(&a);
        let root2 = compute_merkle_root(&a);
        assert_eq!(root1, root2);
    }

    #[test]
    fn merkle_root_feeds_the_raw_hash_not_the_leaf_hash() {
        // The root formula is "SHA-256 over path \0 hash \n" directly; Leaf
        // is a separate, distinct value and must not be nested inside Root.
        let mut entries = BTreeMap::new();
        entries.insert("a.rs".to_string(), sha256_hex(b"contents"));
        let mut expected = Sha256::new();
        expected.update(b"a.rs");
        expected.update(b"\0");
        expected.update(entries["a.rs"].as_bytes());
        expected.update(b"\n");
        assert_eq!(compute_merkle_root(&entries), hex::encode(expected.finalize()));
    }

    #[test]
    fn leaf_hash_differs_from_root_for_single_entry() {
        let hash = sha256_hex(b"contents");
        let leaf = leaf_hash("a.rs", &hash);
        let mut entries = BTreeMap::new();
        entries.insert("a.rs".to_string(), hash);
        assert_ne!(leaf, compute_merkle_root(&entries));
    }

    proptest! {
        #[test]
        fn merkle_root_is_permutation_invariant(
            pairs in proptest::collection::vec(("[a-z/]{1,12}", "[a-f0-9]{8}"), 0..12)
        ) {
            // P2: computeMerkleRoot is invariant under permutation of the
            // input mapping's iteration order. We build the same logical
            // map two different ways (insert order shuffled) and assert the
            // resulting root is identical either way.
            let mut forward: BTreeMap<String, String> = BTreeMap::new();
            for (p, h) in &pairs {
                forward.insert(p.clone(), h.clone());
            }
            let mut backward: BTreeMap<String, String> = BTreeMap::new();
            for (p, h) in pairs.iter().rev() {
                backward.insert(p.clone(), h.clone());
            }
            prop_assert_eq!(compute_merkle_root(&forward), compute_merkle_root(&backward));
        }
    }

    #[test]
    fn ignore_pattern_negation_reincludes_path() {
        let patterns = vec!["**/*.test.ts".to_string(), "!src/keep.test.ts".to_string()];
        assert!(!matches_extra_ignore_patterns("src/other.test.ts", &patterns));
        assert!(matches_extra_ignore_patterns("src/keep.test.ts", &patterns));
        assert!(matches_extra_ignore_patterns("src/main.ts", &patterns));
    }
}
