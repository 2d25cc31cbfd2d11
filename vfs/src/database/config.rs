use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use url::Url;

use crate::content::{AttributesSupplier, Blake3Supplier, ContentDescriptorSupplier, Md5Supplier};
use crate::provider::ProviderKey;
use crate::Error;

/// Selects how the contents on disk are described.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplierKind {
    #[default]
    Md5,
    Blake3,
    /// Size and modification time.
    Attributes,
}

impl SupplierKind {
    pub fn build(self) -> Arc<dyn ContentDescriptorSupplier> {
        match self {
            SupplierKind::Md5 => Arc::new(Md5Supplier::new()),
            SupplierKind::Blake3 => Arc::new(Blake3Supplier::new()),
            SupplierKind::Attributes => Arc::new(AttributesSupplier),
        }
    }
}

impl std::str::FromStr for SupplierKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "md5" => Ok(SupplierKind::Md5),
            "blake3" => Ok(SupplierKind::Blake3),
            "attributes" => Ok(SupplierKind::Attributes),
            other => Err(Error::InvalidArgument(format!("unknown supplier: {}", other))),
        }
    }
}

/// Configuration of a [super::ContentDatabase].
#[serde_with::serde_as]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DatabaseConfig {
    /// The supplier used for providers without an override.
    pub supplier: SupplierKind,

    /// Per-provider supplier overrides.
    #[serde_as(as = "HashMap<serde_with::DisplayFromStr, _>")]
    pub providers: HashMap<ProviderKey, SupplierKind>,

    /// Whether to remember file attributes of handles, which allows
    /// invalidating them from attributes alone.
    pub track_attributes: bool,

    /// Where to persist the database. Not persisted if unset.
    pub snapshot: Option<std::path::PathBuf>,
}

impl DatabaseConfig {
    /// Constructs a config from an URL.
    ///
    /// The following schemes are supported:
    /// - `memory://`, which doesn't persist anything.
    /// - `file:///path/to/snapshot`, persisting into the given file.
    ///
    /// Both accept `supplier` and `track_attributes` query parameters.
    pub fn from_url(s: &str) -> Result<Self, Error> {
        let url = Url::parse(s)
            .map_err(|e| Error::InvalidArgument(format!("unable to parse url: {}", e)))?;

        let mut config = DatabaseConfig::default();
        match url.scheme() {
            "memory" => {
                // memory doesn't support host or path in the URL.
                if url.has_host() || !url.path().is_empty() {
                    return Err(Error::InvalidArgument("invalid url".to_string()));
                }
            }
            "file" => {
                if url.host_str().is_some_and(|h| !h.is_empty()) {
                    return Err(Error::InvalidArgument("no host allowed".to_string()));
                }
                if url.path() == "/" || url.path().is_empty() {
                    return Err(Error::InvalidArgument(
                        "cowardly refusing to persist to /".to_string(),
                    ));
                }
                config.snapshot = Some(url.path().into());
            }
            scheme => {
                return Err(Error::InvalidArgument(format!(
                    "unknown scheme: {}",
                    scheme
                )))
            }
        }

        for (k, v) in url.query_pairs() {
            match k.as_ref() {
                "supplier" => config.supplier = v.parse()?,
                "track_attributes" => {
                    config.track_attributes = v.parse().map_err(|_| {
                        Error::InvalidArgument(format!("invalid track_attributes: {}", v))
                    })?
                }
                other => {
                    return Err(Error::InvalidArgument(format!(
                        "unknown parameter: {}",
                        other
                    )))
                }
            }
        }

        Ok(config)
    }

    pub(crate) fn supplier_for(&self, provider: &ProviderKey) -> SupplierKind {
        self.providers.get(provider).copied().unwrap_or(self.supplier)
    }
}
