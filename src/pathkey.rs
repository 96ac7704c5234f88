use sha1::{Digest, Sha1};

/// Number of hex characters per directory level in the CAS layout.
const PATH_BLOCK_SIZE: usize = 5;

/// Maps a human key to its on-disk location relative to an owner directory.
pub type PathTransform = fn(&str) -> PathKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathKey {
    pub path_name: String,
    pub file_name: String,
}

impl PathKey {
    /// The first `/`-delimited component of the path. Deleting this directory
    /// removes the whole subtree a key hashes into.
    pub fn first_segment(&self) -> &str {
        self.path_name.split('/').next().unwrap_or("")
    }

    pub fn full_path(&self) -> String {
        format!("{}/{}", self.path_name, self.file_name)
    }
}

/// Content-addressed transform: SHA-1 of the key, hex-encoded, partitioned
/// into eight five-character directory levels.
pub fn cas_path_transform(key: &str) -> PathKey {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));

    let mut parts = Vec::with_capacity(digest.len() / PATH_BLOCK_SIZE);
    for i in (0..digest.len()).step_by(PATH_BLOCK_SIZE) {
        parts.push(&digest[i..i + PATH_BLOCK_SIZE]);
    }

    PathKey {
        path_name: parts.join("/"),
        file_name: digest,
    }
}

/// Identity transform, for tests and flat deployments.
pub fn default_path_transform(key: &str) -> PathKey {
    PathKey {
        path_name: key.to_string(),
        file_name: key.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cas_transform_known_vector() {
        let path_key = cas_path_transform("some-key");

        assert_eq!(path_key.file_name, "9cea46b39bd44a1ef9f3e71bfe9e45c24d3300f6");
        assert_eq!(
            path_key.path_name,
            "9cea4/6b39b/d44a1/ef9f3/e71bf/e9e45/c24d3/300f6"
        );
    }

    #[test]
    fn test_cas_transform_deterministic() {
        let a = cas_path_transform("picture_0.png");
        let b = cas_path_transform("picture_0.png");
        assert_eq!(a, b);
    }

    #[test]
    fn test_cas_full_path_charset() {
        let full = cas_path_transform("Some Key With Spaces!").full_path();
        assert!(full
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase() || c == '/'));
    }

    #[test]
    fn test_first_segment_is_leading_block() {
        let path_key = cas_path_transform("some-key");
        assert_eq!(path_key.first_segment(), "9cea4");
    }

    #[test]
    fn test_full_path_joins_path_and_file() {
        let path_key = PathKey {
            path_name: "aaaaa/bbbbb".to_string(),
            file_name: "aaaaabbbbb".to_string(),
        };
        assert_eq!(path_key.full_path(), "aaaaa/bbbbb/aaaaabbbbb");
    }

    #[test]
    fn test_default_transform_is_identity() {
        let path_key = default_path_transform("plain.txt");
        assert_eq!(path_key.path_name, "plain.txt");
        assert_eq!(path_key.file_name, "plain.txt");
        assert_eq!(path_key.first_segment(), "plain.txt");
    }
}
