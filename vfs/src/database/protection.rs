use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::path::{Path, PathBuf};
use crate::provider::ProviderKey;
use crate::Error;

/// Asks whether a write outside of the enabled directories may happen.
pub trait WritePrompter: Send + Sync {
    /// Returns true if writing to `path` of `provider` is allowed.
    fn allow_write(&self, provider: &ProviderKey, path: &Path) -> bool;
}

impl<F> WritePrompter for F
where
    F: Fn(&ProviderKey, &Path) -> bool + Send + Sync,
{
    fn allow_write(&self, provider: &ProviderKey, path: &Path) -> bool {
        self(provider, path)
    }
}

/// Restricts writes to a set of directories.
///
/// Writes anywhere else need to be approved by the [WritePrompter]. Once a
/// write is approved, the rest of its directory is enabled too.
pub struct WriteProtection {
    enabled: RwLock<HashMap<ProviderKey, BTreeSet<PathBuf>>>,
    prompter: Arc<dyn WritePrompter>,
}

impl WriteProtection {
    pub fn new(
        enabled: HashMap<ProviderKey, BTreeSet<PathBuf>>,
        prompter: Arc<dyn WritePrompter>,
    ) -> Self {
        Self {
            enabled: RwLock::new(enabled),
            prompter,
        }
    }

    fn is_enabled(&self, provider: &ProviderKey, path: &Path) -> bool {
        let enabled = self.enabled.read();
        let Some(dirs) = enabled.get(provider) else {
            return false;
        };
        // check the path and each of its ancestors.
        let mut current = Some(path);
        while let Some(p) = current {
            if dirs.contains(p) {
                return true;
            }
            current = p.parent();
        }
        false
    }

    /// Checks if writing to `path` is allowed, prompting if needed.
    pub fn check(&self, provider: &ProviderKey, path: &Path) -> Result<(), Error> {
        if self.is_enabled(provider, path) {
            return Ok(());
        }
        if !self.prompter.allow_write(provider, path) {
            warn!(provider = %provider, path = %path, "write request forbidden");
            return Err(Error::WriteForbidden {
                provider: *provider,
                path: path.to_owned(),
            });
        }

        let dir = path.parent().unwrap_or(Path::ROOT).to_owned();
        debug!(provider = %provider, dir = %dir, "write enabled");
        self.enabled.write().entry(*provider).or_default().insert(dir);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::WriteProtection;
    use crate::path::{Path, PathBuf};
    use crate::provider::ProviderKey;
    use crate::Error;

    fn key() -> ProviderKey {
        ProviderKey::from_uuid(uuid::Uuid::nil())
    }

    #[test]
    fn enabled_directory() {
        let enabled: BTreeSet<PathBuf> = ["out".parse().unwrap()].into();
        let protection = WriteProtection::new(
            HashMap::from([(key(), enabled)]),
            Arc::new(|_: &ProviderKey, _: &Path| false),
        );

        protection
            .check(&key(), &"out/a/b".parse::<PathBuf>().unwrap())
            .expect("must be allowed");
        assert!(matches!(
            protection.check(&key(), &"src/a".parse::<PathBuf>().unwrap()),
            Err(Error::WriteForbidden { .. })
        ));
    }

    #[test]
    fn approval_is_remembered() {
        let prompts = Arc::new(AtomicUsize::new(0));
        let protection = WriteProtection::new(HashMap::new(), {
            let prompts = prompts.clone();
            Arc::new(move |_: &ProviderKey, _: &Path| {
                prompts.fetch_add(1, Ordering::SeqCst);
                true
            })
        });

        protection.check(&key(), &"dir/a".parse::<PathBuf>().unwrap()).unwrap();
        protection.check(&key(), &"dir/b".parse::<PathBuf>().unwrap()).unwrap();
        assert_eq!(1, prompts.load(Ordering::SeqCst));
    }
}
