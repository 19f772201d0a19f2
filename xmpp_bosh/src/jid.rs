//! Jabber identifiers.

use core::{fmt, str::FromStr};

/// A JID of the form `[node@]domain[/resource]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Jid {
    node: Option<String>,
    domain: String,
    resource: Option<String>,
}

/// The string is not a usable JID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid JID: {0:?}")]
pub struct InvalidJid(pub String);

impl Jid {
    /// The local part, if any.
    #[must_use]
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    /// The domain part.
    #[must_use]
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// The resource part, if any.
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    /// The JID without its resource.
    #[must_use]
    pub fn bare(&self) -> Self {
        Self {
            node: self.node.clone(),
            domain: self.domain.clone(),
            resource: None,
        }
    }

    /// Whether a resource is present.
    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.resource.is_some()
    }
}

impl FromStr for Jid {
    type Err = InvalidJid;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (bare, resource) = match s.split_once('/') {
            Some((bare, resource)) => (bare, Some(resource)),
            None => (s, None),
        };
        let (node, domain) = match bare.split_once('@') {
            Some((node, domain)) => (Some(node), domain),
            None => (None, bare),
        };

        if domain.is_empty()
            || node.is_some_and(str::is_empty)
            || resource.is_some_and(str::is_empty)
        {
            return Err(InvalidJid(s.to_owned()));
        }

        Ok(Self {
            node: node.map(str::to_owned),
            domain: domain.to_owned(),
            resource: resource.map(str::to_owned),
        })
    }
}

impl fmt::Display for Jid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(node) = &self.node {
            write!(f, "{node}@")?;
        }
        f.write_str(&self.domain)?;
        if let Some(resource) = &self.resource {
            write!(f, "/{resource}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_jid() {
        let jid: Jid = "juliet@capulet.lit/balcony".parse().expect("valid");
        assert_eq!(jid.node(), Some("juliet"));
        assert_eq!(jid.domain(), "capulet.lit");
        assert_eq!(jid.resource(), Some("balcony"));
        assert!(jid.is_full());
        assert_eq!(jid.bare().to_string(), "juliet@capulet.lit");
    }

    #[test]
    fn resource_may_contain_slashes() {
        let jid: Jid = "capulet.lit/a/b".parse().expect("valid");
        assert_eq!(jid.node(), None);
        assert_eq!(jid.resource(), Some("a/b"));
        assert_eq!(jid.to_string(), "capulet.lit/a/b");
    }

    #[test]
    fn rejects_empty_parts() {
        assert!("".parse::<Jid>().is_err());
        assert!("@capulet.lit".parse::<Jid>().is_err());
        assert!("juliet@capulet.lit/".parse::<Jid>().is_err());
    }
}
