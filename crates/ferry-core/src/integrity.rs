//! Source admission: origin/allow-list checks, traversal rejection and
//! subresource-integrity digests.

use std::fmt;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha256, Sha384, Sha512};
use url::Url;

use crate::config::{IntegritySettings, SourceCandidate};
use crate::error::IntegrityError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        match self {
            HashAlgorithm::Sha256 => Sha256::digest(bytes).to_vec(),
            HashAlgorithm::Sha384 => Sha384::digest(bytes).to_vec(),
            HashAlgorithm::Sha512 => Sha512::digest(bytes).to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ExpectedDigest {
    algorithm: HashAlgorithm,
    digest: Vec<u8>,
}

/// Parsed `alg-base64` integrity metadata. Several space-separated values are
/// allowed; only those using the strongest algorithm present are checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityHash {
    expected: Vec<ExpectedDigest>,
    raw: String,
}

impl IntegrityHash {
    pub fn parse(value: &str) -> Result<Self, IntegrityError> {
        let malformed = || IntegrityError::MalformedHash {
            value: value.to_string(),
        };
        let mut expected = Vec::new();
        for token in value.split_whitespace() {
            let (alg, encoded) = token.split_once('-').ok_or_else(malformed)?;
            let algorithm = match alg.to_ascii_lowercase().as_str() {
                "sha256" => HashAlgorithm::Sha256,
                "sha384" => HashAlgorithm::Sha384,
                "sha512" => HashAlgorithm::Sha512,
                _ => return Err(malformed()),
            };
            // SRI allows `?options` after the digest; they carry no meaning here.
            let encoded = encoded.split('?').next().unwrap_or_default();
            let digest = STANDARD.decode(encoded).map_err(|_| malformed())?;
            if digest.len() != algorithm.digest_len() {
                return Err(malformed());
            }
            expected.push(ExpectedDigest { algorithm, digest });
        }
        if expected.is_empty() {
            return Err(malformed());
        }
        let strongest = expected.iter().map(|d| d.algorithm).max().unwrap_or(HashAlgorithm::Sha256);
        expected.retain(|d| d.algorithm == strongest);
        Ok(Self {
            expected,
            raw: value.trim().to_string(),
        })
    }

    /// Build the integrity value for `bytes`, mainly for tooling and tests.
    pub fn compute(algorithm: HashAlgorithm, bytes: &[u8]) -> Self {
        let digest = algorithm.digest(bytes);
        let raw = format!("{}-{}", algorithm.as_str(), STANDARD.encode(&digest));
        Self {
            expected: vec![ExpectedDigest { algorithm, digest }],
            raw,
        }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.expected
            .first()
            .map(|d| d.algorithm)
            .unwrap_or(HashAlgorithm::Sha256)
    }

    pub fn verify(&self, url: &str, bytes: &[u8]) -> Result<(), IntegrityError> {
        let algorithm = self.algorithm();
        let actual = algorithm.digest(bytes);
        if self.expected.iter().any(|d| d.digest == actual) {
            return Ok(());
        }
        Err(IntegrityError::HashMismatch {
            url: url.to_string(),
            algorithm: algorithm.as_str().to_string(),
            expected: self.raw.clone(),
            actual: format!("{}-{}", algorithm.as_str(), STANDARD.encode(&actual)),
        })
    }
}

impl fmt::Display for IntegrityHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Remote(Url),
    Local(PathBuf),
}

/// A candidate that passed admission, with its resolved location.
#[derive(Debug, Clone)]
pub struct ValidatedSource {
    pub candidate: SourceCandidate,
    pub location: SourceLocation,
    pub integrity: Option<IntegrityHash>,
}

impl ValidatedSource {
    pub fn is_remote(&self) -> bool {
        matches!(self.location, SourceLocation::Remote(_))
    }

    /// The URL as configured; this is the cache key for the source.
    pub fn url(&self) -> &str {
        &self.candidate.url
    }

    pub fn display_location(&self) -> String {
        match &self.location {
            SourceLocation::Remote(url) => url.to_string(),
            SourceLocation::Local(path) => path.display().to_string(),
        }
    }
}

enum Reference {
    SameOrigin(Option<Url>),
    CrossOrigin(Url),
}

#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    origin: Option<Url>,
    trusted_hosts: Vec<String>,
    bundle_dir: PathBuf,
}

impl IntegrityValidator {
    pub fn new(origin: Option<Url>, settings: &IntegritySettings, bundle_dir: PathBuf) -> Self {
        let trusted_hosts = settings
            .trusted_hosts
            .iter()
            .map(|h| h.trim().trim_end_matches('.').to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        Self {
            origin,
            trusted_hosts,
            bundle_dir,
        }
    }

    /// Whether `url` may be fetched at all.
    pub fn validate(&self, url: &str) -> bool {
        self.classify(url).is_ok()
    }

    /// Admit `candidate` and resolve where its bytes live.
    pub fn assess(&self, candidate: &SourceCandidate) -> Result<ValidatedSource, IntegrityError> {
        let reference = self.classify(&candidate.url)?;
        let integrity = candidate
            .integrity
            .as_deref()
            .map(IntegrityHash::parse)
            .transpose()?;
        let location = if candidate.tier.is_local() {
            match reference {
                Reference::SameOrigin(None) => {
                    SourceLocation::Local(self.bundle_dir.join(bundle_relative(&candidate.url)))
                }
                _ => {
                    return Err(IntegrityError::InvalidUrl {
                        url: candidate.url.clone(),
                        reason: "local sources must be relative to the bundle".into(),
                    })
                }
            }
        } else {
            match reference {
                Reference::SameOrigin(Some(url)) | Reference::CrossOrigin(url) => {
                    SourceLocation::Remote(url)
                }
                Reference::SameOrigin(None) => SourceLocation::Remote(self.join_origin(&candidate.url)?),
            }
        };
        Ok(ValidatedSource {
            candidate: candidate.clone(),
            location,
            integrity,
        })
    }

    fn classify(&self, raw: &str) -> Result<Reference, IntegrityError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IntegrityError::InvalidUrl {
                url: raw.to_string(),
                reason: "empty".into(),
            });
        }
        // Checked on the raw text: Url::parse would already have collapsed `..`.
        if has_traversal(trimmed) {
            return Err(IntegrityError::PathTraversal {
                url: raw.to_string(),
            });
        }
        let parsed = match Url::parse(trimmed) {
            Ok(url) => url,
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                if trimmed.starts_with("//") {
                    return Err(IntegrityError::InvalidUrl {
                        url: raw.to_string(),
                        reason: "scheme-relative urls are not supported".into(),
                    });
                }
                return Ok(Reference::SameOrigin(None));
            }
            Err(err) => {
                return Err(IntegrityError::InvalidUrl {
                    url: raw.to_string(),
                    reason: err.to_string(),
                })
            }
        };
        if self.is_same_origin(&parsed) {
            return Ok(Reference::SameOrigin(Some(parsed)));
        }
        if parsed.scheme() != "https" {
            return Err(IntegrityError::InsecureScheme {
                url: raw.to_string(),
                scheme: parsed.scheme().to_string(),
            });
        }
        let host = parsed.host_str().unwrap_or_default().to_ascii_lowercase();
        if self.trusted_hosts.iter().any(|h| *h == host) {
            Ok(Reference::CrossOrigin(parsed))
        } else {
            Err(IntegrityError::UntrustedHost {
                url: raw.to_string(),
                host,
            })
        }
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        let Some(origin) = &self.origin else {
            return false;
        };
        url.scheme() == origin.scheme()
            && url.host_str().map(str::to_ascii_lowercase)
                == origin.host_str().map(str::to_ascii_lowercase)
            && url.port_or_known_default() == origin.port_or_known_default()
    }

    fn join_origin(&self, relative: &str) -> Result<Url, IntegrityError> {
        let Some(origin) = &self.origin else {
            return Err(IntegrityError::InvalidUrl {
                url: relative.to_string(),
                reason: "relative remote source needs a configured origin".into(),
            });
        };
        origin.join(relative).map_err(|e| IntegrityError::InvalidUrl {
            url: relative.to_string(),
            reason: e.to_string(),
        })
    }
}

fn has_traversal(raw: &str) -> bool {
    let path = raw.split(|c: char| c == '?' || c == '#').next().unwrap_or_default();
    let decoded = path
        .to_ascii_lowercase()
        .replace("%2e", ".")
        .replace("%2f", "/")
        .replace("%5c", "/")
        .replace('\\', "/");
    decoded.split('/').any(|segment| segment == "..")
}

fn bundle_relative(raw: &str) -> PathBuf {
    let path = raw.split(|c: char| c == '?' || c == '#').next().unwrap_or_default();
    path.trim_start_matches("./")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceTier;

    fn validator() -> IntegrityValidator {
        IntegrityValidator::new(
            Some(Url::parse("https://app.example").unwrap()),
            &IntegritySettings {
                trusted_hosts: vec!["cdn.jsdelivr.net".into(), "Unpkg.com".into()],
            },
            PathBuf::from("/opt/app/assets"),
        )
    }

    fn candidate(url: &str, tier: SourceTier) -> SourceCandidate {
        SourceCandidate {
            url: url.into(),
            tier,
            integrity: None,
        }
    }

    #[test]
    fn untrusted_and_traversal_urls_are_rejected() {
        let v = validator();
        assert!(!v.validate("https://evil.example/x.js"));
        assert!(!v.validate("./../../etc/passwd"));
        assert!(!v.validate("models/%2E%2E/secret.onnx"));
        assert!(!v.validate("models\\..\\secret.onnx"));
        assert!(!v.validate("http://cdn.jsdelivr.net/ort.wasm"));
        assert!(v.validate("https://cdn.jsdelivr.net/npm/ort.wasm"));
        assert!(v.validate("https://UNPKG.com/ort.wasm"));
        assert!(v.validate("./models/yolov10n.onnx"));
        assert!(v.validate("https://app.example/models/yolov10n.onnx"));
    }

    #[test]
    fn same_origin_allows_any_path_without_dotdot() {
        let v = validator();
        assert!(v.validate("/models/file..name.onnx"));
        assert!(!v.validate("https://app.example/a/../b.onnx"));
    }

    #[test]
    fn assess_resolves_locations() {
        let v = validator();
        let local = v
            .assess(&candidate("./models/yolov10n.onnx", SourceTier::Local))
            .unwrap();
        assert_eq!(
            local.location,
            SourceLocation::Local(PathBuf::from("/opt/app/assets/models/yolov10n.onnx"))
        );
        let remote = v
            .assess(&candidate("models/yolov10n.onnx", SourceTier::RemotePrimary))
            .unwrap();
        assert_eq!(
            remote.location,
            SourceLocation::Remote(Url::parse("https://app.example/models/yolov10n.onnx").unwrap())
        );
        assert!(v
            .assess(&candidate("https://cdn.jsdelivr.net/m.onnx", SourceTier::Local))
            .is_err());
    }

    #[test]
    fn hash_mismatch_is_a_hard_failure() {
        let good = IntegrityHash::compute(HashAlgorithm::Sha384, b"model-bytes");
        let parsed = IntegrityHash::parse(&good.to_string()).unwrap();
        assert!(parsed.verify("u", b"model-bytes").is_ok());
        let err = parsed.verify("u", b"tampered").unwrap_err();
        assert!(matches!(err, IntegrityError::HashMismatch { .. }));
    }

    #[test]
    fn strongest_algorithm_wins() {
        let weak = IntegrityHash::compute(HashAlgorithm::Sha256, b"abc");
        let strong = IntegrityHash::compute(HashAlgorithm::Sha512, b"abc");
        let both = IntegrityHash::parse(&format!("{weak} {strong}")).unwrap();
        assert_eq!(both.algorithm(), HashAlgorithm::Sha512);
        assert!(both.verify("u", b"abc").is_ok());
    }

    #[test]
    fn malformed_hashes_are_rejected() {
        for value in ["", "md5-abc", "sha384", "sha256-!!!", "sha256-YWJj"] {
            assert!(IntegrityHash::parse(value).is_err(), "{value}");
        }
        let mut c = candidate("https://cdn.jsdelivr.net/m.onnx", SourceTier::RemotePrimary);
        c.integrity = Some("sha384-nope".into());
        assert!(matches!(
            validator().assess(&c),
            Err(IntegrityError::MalformedHash { .. })
        ));
    }
}
