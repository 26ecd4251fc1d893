//! Entity resolution boundary.
//!
//! Key assignment belongs to an external system. The pipeline only asks it
//! for stable keys and never guesses: a record the resolver cannot place is
//! excluded from derived facts and queued for operator review.

use crate::{
    fact::{PaymentFact, RejectReason},
    types::{PaymentKey, ProviderKey},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Maps natural business identifiers to stable keys.
pub trait EntityResolver: Send + Sync {
    fn resolve_payment(&self, payment_id: &str) -> Option<PaymentKey>;
    fn resolve_provider(&self, provider_id: &str) -> Option<ProviderKey>;
}

/// A payment fact with both of its keys resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFact {
    pub payment_key:  PaymentKey,
    pub provider_key: ProviderKey,
    pub fact:         PaymentFact,
}

pub fn resolve(resolver: &dyn EntityResolver, fact: PaymentFact) -> Result<ResolvedFact, (PaymentFact, RejectReason)> {
    let Some(payment_key) = resolver.resolve_payment(&fact.payment_id) else {
        return Err((fact, RejectReason::UnresolvedPayment));
    };
    let provider_key = fact
        .provider_id
        .as_deref()
        .and_then(|p| resolver.resolve_provider(p));
    match provider_key {
        Some(provider_key) => Ok(ResolvedFact { payment_key, provider_key, fact }),
        None => Err((fact, RejectReason::UnresolvedProvider)),
    }
}

/// One line of a resolver export: `kind` is `payment` or `provider`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverRow {
    pub kind:       String,
    pub natural_id: String,
    pub stable_key: String,
}

/// Lookup-table resolver fed from a key export of the upstream resolver.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    payments:  HashMap<String, PaymentKey>,
    providers: HashMap<String, ProviderKey>,
}

impl StaticResolver {
    pub fn from_rows(rows: impl IntoIterator<Item = ResolverRow>) -> Self {
        let mut resolver = Self::default();
        for row in rows {
            match row.kind.as_str() {
                "payment"  => { resolver.payments.insert(row.natural_id, row.stable_key); }
                "provider" => { resolver.providers.insert(row.natural_id, row.stable_key); }
                other      => log::warn!("resolver: ignoring row of unknown kind '{other}'"),
            }
        }
        resolver
    }

    /// Resolver whose stable keys equal the natural identifiers it knows.
    pub fn identity<P, Q>(payment_ids: P, provider_ids: Q) -> Self
    where
        P: IntoIterator<Item = String>,
        Q: IntoIterator<Item = String>,
    {
        Self {
            payments:  payment_ids.into_iter().map(|id| (id.clone(), id)).collect(),
            providers: provider_ids.into_iter().map(|id| (id.clone(), id)).collect(),
        }
    }
}

impl EntityResolver for StaticResolver {
    fn resolve_payment(&self, payment_id: &str) -> Option<PaymentKey> {
        self.payments.get(payment_id).cloned()
    }

    fn resolve_provider(&self, provider_id: &str) -> Option<ProviderKey> {
        self.providers.get(provider_id).cloned()
    }
}
