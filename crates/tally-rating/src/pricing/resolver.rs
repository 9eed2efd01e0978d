use super::account::AccountDirectory;
use super::catalog::PricingCatalog;
use crate::resilience::Resilience;
use std::sync::Arc;
use tally_common::{Result, DEFAULT_PRICING_COUNTRY};
use tracing::{debug, instrument};

/// Resolves the pricing country of an organization; prices and rate
/// functions are looked up in its catalog
pub struct PricingResolver {
    accounts: Arc<dyn AccountDirectory>,
    catalog: Arc<PricingCatalog>,
    resilience: Resilience,
    fallback_country: String,
}

impl PricingResolver {
    pub fn new(
        accounts: Arc<dyn AccountDirectory>,
        catalog: Arc<PricingCatalog>,
        resilience: Resilience,
    ) -> Self {
        Self {
            accounts,
            catalog,
            resilience,
            fallback_country: DEFAULT_PRICING_COUNTRY.to_string(),
        }
    }

    /// Country used when an account has none
    pub fn with_fallback_country(mut self, country: impl Into<String>) -> Self {
        self.fallback_country = country.into();
        self
    }

    pub fn catalog(&self) -> &Arc<PricingCatalog> {
        &self.catalog
    }

    /// Billing country of an organization
    #[instrument(skip(self))]
    pub async fn resolve_country(&self, organization_id: &str) -> Result<String> {
        let country = self
            .resilience
            .call("pricing_country", || {
                self.accounts.pricing_country(organization_id)
            })
            .await?;

        Ok(match country {
            Some(country) => country,
            None => {
                debug!(
                    organization_id,
                    fallback = %self.fallback_country,
                    "No pricing country on account, using fallback"
                );
                self.fallback_country.clone()
            }
        })
    }
}
