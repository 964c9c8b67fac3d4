use std::convert::TryFrom;
use std::fmt;

use http::Uri;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Error;
use crate::oci::digest::Digest;

static REPOSITORY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-*)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:[._]|__|-*)[a-z0-9]+)*)*$")
        .unwrap()
});

static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\w[\w.-]{0,127}$").unwrap());

/// The part of a reference after the repository, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Tag(String),
    Digest(Digest),
}

/// A parsed artifact reference, `registry/repository[:tag|@digest]`.
///
/// A reference carrying both a tag and a digest (`repo:tag@digest`) collapses
/// to its digest form on parse; the tag is discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    registry: String,
    repository: String,
    target: Option<Target>,
}

impl Reference {
    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        match &self.target {
            Some(Target::Tag(tag)) => Some(tag),
            _ => None,
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match &self.target {
            Some(Target::Digest(digest)) => Some(digest),
            _ => None,
        }
    }

    /// The tag or digest string sent to the registry when resolving,
    /// defaulting to `latest` for a bare repository reference.
    pub fn target_or_latest(&self) -> String {
        match &self.target {
            Some(Target::Tag(tag)) => tag.clone(),
            Some(Target::Digest(digest)) => digest.to_string(),
            None => "latest".to_string(),
        }
    }

    /// Replace the target with a digest, keeping registry and repository.
    pub fn with_digest(&self, digest: Digest) -> Reference {
        Reference {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            target: Some(Target::Digest(digest)),
        }
    }

    fn validate_registry(registry: &str) -> Result<(), Error> {
        if registry.is_empty() || registry.contains('@') {
            return Err(Error::InvalidRegistry(registry.to_string()));
        }

        // A registry is a hostname with an optional port. Round-trip through
        // URI parsing and require the authority to come back unchanged.
        let uri = format!("dummy://{}", registry)
            .parse::<Uri>()
            .map_err(|_| Error::InvalidRegistry(registry.to_string()))?;
        match uri.authority() {
            Some(authority) if authority.as_str() == registry => Ok(()),
            _ => Err(Error::InvalidRegistry(registry.to_string())),
        }
    }

    pub(crate) fn validate_repository(repository: &str) -> Result<(), Error> {
        if REPOSITORY_PATTERN.is_match(repository) {
            Ok(())
        } else {
            Err(Error::InvalidRepository(repository.to_string()))
        }
    }

    fn validate_target(target: &str) -> Result<Option<Target>, Error> {
        if target.is_empty() {
            return Ok(None);
        }
        if target.contains(':') {
            return Ok(Some(Target::Digest(Digest::try_from(target)?)));
        }
        if TAG_PATTERN.is_match(target) {
            return Ok(Some(Target::Tag(target.to_string())));
        }
        Err(Error::InvalidTag(target.to_string()))
    }
}

impl TryFrom<&str> for Reference {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let (registry, rest) = match value.split_once('/') {
            Some(parts) => parts,
            None => (value, ""),
        };
        Reference::validate_registry(registry)?;
        if rest.is_empty() {
            return Err(Error::InvalidRepository(rest.to_string()));
        }

        let (repository, target) = if let Some((prefix, digest)) = rest.split_once('@') {
            // Form B carries both a tag and a digest; the tag is dropped.
            let repository = match prefix.split_once(':') {
                Some((repository, _tag)) => repository,
                None => prefix,
            };
            (repository, digest)
        } else if let Some((repository, tag)) = rest.split_once(':') {
            (repository, tag)
        } else {
            (rest, "")
        };

        Reference::validate_repository(repository)?;
        let target = Reference::validate_target(target)?;

        Ok(Reference {
            registry: registry.to_string(),
            repository: repository.to_string(),
            target,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Some(Target::Digest(digest)) => {
                write!(f, "{}/{}@{}", self.registry, self.repository, digest)
            }
            Some(Target::Tag(tag)) => write!(f, "{}/{}:{}", self.registry, self.repository, tag),
            None => write!(f, "{}/{}", self.registry, self.repository),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(value: &str) -> Result<Reference, Error> {
        Reference::try_from(value)
    }

    #[test]
    fn parses_tag_form() {
        let reference = parse("localhost:5000/library/registry:2.8.3").unwrap();
        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.repository(), "library/registry");
        assert_eq!(reference.tag(), Some("2.8.3"));
        assert_eq!(reference.digest(), None);
    }

    #[test]
    fn parses_digest_form() {
        let reference = parse(
            "ghcr.io/library/registry@sha256:1b640322f9a983281970daaeba1a6d303f399d67890644389ff419d951963e20",
        )
        .unwrap();
        assert_eq!(
            reference.digest().unwrap().to_string(),
            "sha256:1b640322f9a983281970daaeba1a6d303f399d67890644389ff419d951963e20"
        );
    }

    #[test]
    fn tag_and_digest_collapses_to_digest_form() {
        let reference = parse(
            "localhost:5000/library/registry:2.8.3@sha256:1b640322f9a983281970daaeba1a6d303f399d67890644389ff419d951963e20",
        )
        .unwrap();
        assert_eq!(reference.registry(), "localhost:5000");
        assert_eq!(reference.repository(), "library/registry");
        assert_eq!(reference.tag(), None);
        assert_eq!(
            reference.to_string(),
            "localhost:5000/library/registry@sha256:1b640322f9a983281970daaeba1a6d303f399d67890644389ff419d951963e20"
        );
    }

    #[test]
    fn round_trips_all_plain_forms() {
        for value in [
            "localhost:5000/library/registry",
            "localhost:5000/library/registry:2.8.3",
            "ghcr.io/some/nested/repo@sha256:1b640322f9a983281970daaeba1a6d303f399d67890644389ff419d951963e20",
        ] {
            assert_eq!(parse(value).unwrap().to_string(), value);
        }
    }

    #[test]
    fn rejects_empty_registry() {
        assert!(matches!(
            parse("/library/registry"),
            Err(Error::InvalidRegistry(_))
        ));
    }

    #[test]
    fn rejects_bare_tag() {
        assert!(matches!(parse(":tag"), Err(Error::InvalidRegistry(_))));
    }

    #[test]
    fn rejects_missing_repository() {
        assert!(matches!(
            parse("localhost:5000/"),
            Err(Error::InvalidRepository(_))
        ));
        assert!(matches!(parse("localhost"), Err(Error::InvalidRepository(_))));
    }

    #[test]
    fn rejects_uppercase_repository() {
        assert!(matches!(
            parse("localhost:5000/Library/registry"),
            Err(Error::InvalidRepository(_))
        ));
    }

    #[test]
    fn rejects_invalid_registry_shapes() {
        for value in [
            "user@host/repo",
            "host a/repo",
            "host?query/repo",
        ] {
            assert!(
                matches!(parse(value), Err(Error::InvalidRegistry(_))),
                "expected `{}` to be rejected",
                value
            );
        }
    }

    #[test]
    fn rejects_overlong_tag() {
        let value = format!("localhost:5000/repo:{}", "t".repeat(129));
        assert!(matches!(
            parse(value.as_str()),
            Err(Error::InvalidTag(_))
        ));
    }

    #[test]
    fn rejects_malformed_digest_target() {
        assert!(matches!(
            parse("localhost:5000/repo@sha256:beef"),
            Err(Error::InvalidDigest(_))
        ));
    }

    #[test]
    fn repository_separator_rules() {
        assert!(parse("r.io/a__b").is_ok());
        assert!(parse("r.io/a--b").is_ok());
        assert!(parse("r.io/a.b_c-d/e").is_ok());
        assert!(matches!(parse("r.io/a..b"), Err(Error::InvalidRepository(_))));
        assert!(matches!(parse("r.io/-ab"), Err(Error::InvalidRepository(_))));
        assert!(matches!(parse("r.io/ab-"), Err(Error::InvalidRepository(_))));
    }
}
