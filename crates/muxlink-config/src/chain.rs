//! Middleware chain references.
//!
//! Configs refer to middlewares by registry kind, by ready instance, or by
//! factory; chains are a single reference or a list containing at most one
//! `Base` marker that splices in the inherited chain at composition time.

use crate::error::{ConfigError, Result};
use std::fmt;
use std::sync::Arc;

/// One middleware reference. `M` is the runtime's instance handle type.
pub enum ChainRef<M> {
    /// Expands to the inherited chain in place; never survives composition.
    Base,
    /// Resolved lazily from the middleware registry by kind.
    Kind(String),
    /// Ready-made instance.
    Instance(M),
    /// Producer invoked on first access; the registry memoizes the result.
    Factory(Arc<dyn Fn() -> M + Send + Sync>),
}

impl<M: Clone> Clone for ChainRef<M> {
    fn clone(&self) -> Self {
        match self {
            ChainRef::Base => ChainRef::Base,
            ChainRef::Kind(kind) => ChainRef::Kind(kind.clone()),
            ChainRef::Instance(m) => ChainRef::Instance(m.clone()),
            ChainRef::Factory(f) => ChainRef::Factory(f.clone()),
        }
    }
}

impl<M> fmt::Debug for ChainRef<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainRef::Base => write!(f, "Base"),
            ChainRef::Kind(kind) => write!(f, "Kind({})", kind),
            ChainRef::Instance(_) => write!(f, "Instance(..)"),
            ChainRef::Factory(_) => write!(f, "Factory(..)"),
        }
    }
}

impl<M> ChainRef<M> {
    pub fn kind(kind: impl Into<String>) -> Self {
        ChainRef::Kind(kind.into())
    }

    pub fn factory(f: impl Fn() -> M + Send + Sync + 'static) -> Self {
        ChainRef::Factory(Arc::new(f))
    }
}

/// A chain as written in options: one reference or a list.
#[derive(Debug)]
pub enum ChainSpec<M> {
    One(ChainRef<M>),
    Many(Vec<ChainRef<M>>),
}

impl<M: Clone> Clone for ChainSpec<M> {
    fn clone(&self) -> Self {
        match self {
            ChainSpec::One(r) => ChainSpec::One(r.clone()),
            ChainSpec::Many(list) => ChainSpec::Many(list.clone()),
        }
    }
}

impl<M> ChainSpec<M> {
    pub fn one(r: ChainRef<M>) -> Self {
        ChainSpec::One(r)
    }

    pub fn kinds<I: IntoIterator<Item = S>, S: Into<String>>(kinds: I) -> Self {
        ChainSpec::Many(kinds.into_iter().map(|k| ChainRef::Kind(k.into())).collect())
    }
}

/// Expand a chain spec against the inherited chain. The `Base` marker may
/// appear at most once; the result never contains it.
pub fn expand_chain<M: Clone>(
    spec: &ChainSpec<M>,
    inherited: &[ChainRef<M>],
) -> Result<Vec<ChainRef<M>>> {
    let refs: &[ChainRef<M>] = match spec {
        ChainSpec::One(r) => std::slice::from_ref(r),
        ChainSpec::Many(list) => list,
    };
    let mut out = Vec::with_capacity(refs.len() + inherited.len());
    let mut base_seen = false;
    for r in refs {
        match r {
            ChainRef::Base => {
                if base_seen {
                    return Err(ConfigError::DuplicateBaseMarker);
                }
                base_seen = true;
                out.extend(inherited.iter().cloned());
            }
            other => out.push(other.clone()),
        }
    }
    Ok(out)
}
