//! Identity resolution between provider customers and internal users

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::provider::BillingProvider;
use crate::store::ProfileStore;

/// How a customer reference was mapped to a user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Local profile holds the customer reference
    Linked(String),
    /// Local link missing, provider customer metadata names the user
    FromProviderMetadata(String),
    Unresolved,
}

impl Resolution {
    pub fn user_id(&self) -> Option<&str> {
        match self {
            Resolution::Linked(id) | Resolution::FromProviderMetadata(id) => Some(id),
            Resolution::Unresolved => None,
        }
    }
}

#[derive(Clone)]
pub struct IdentityResolver {
    profiles: Arc<dyn ProfileStore>,
    provider: Arc<dyn BillingProvider>,
}

impl IdentityResolver {
    pub fn new(profiles: Arc<dyn ProfileStore>, provider: Arc<dyn BillingProvider>) -> Self {
        Self { profiles, provider }
    }

    /// Local lookup only. `None` when no profile holds the reference.
    pub async fn resolve_user_id(&self, customer_ref: &str) -> BillingResult<Option<String>> {
        self.profiles.find_user_by_customer(customer_ref).await
    }

    /// Local lookup, then the provider customer's `user_id` metadata.
    ///
    /// A customer the provider does not know, or one without metadata, is
    /// `Unresolved`. Transient failures propagate so the event is not recorded
    /// before its user can be identified.
    pub async fn resolve_with_fallback(&self, customer_ref: &str) -> BillingResult<Resolution> {
        if let Some(user_id) = self.resolve_user_id(customer_ref).await? {
            return Ok(Resolution::Linked(user_id));
        }

        match self.provider.retrieve_customer(customer_ref).await {
            Ok(customer) => match customer.user_id {
                Some(user_id) => {
                    tracing::info!(
                        customer_ref = %customer_ref,
                        user_id = %user_id,
                        "Resolved customer from provider metadata"
                    );
                    Ok(Resolution::FromProviderMetadata(user_id))
                }
                None => {
                    tracing::warn!(
                        customer_ref = %customer_ref,
                        "Provider customer has no user_id metadata"
                    );
                    Ok(Resolution::Unresolved)
                }
            },
            Err(BillingError::CustomerNotFound(_)) => {
                tracing::warn!(customer_ref = %customer_ref, "Customer unknown to provider");
                Ok(Resolution::Unresolved)
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    customer_ref = %customer_ref,
                    error = %e,
                    "Provider unavailable during identity fallback"
                );
                Err(e)
            }
            Err(e) => {
                tracing::warn!(
                    customer_ref = %customer_ref,
                    error = %e,
                    "Provider lookup failed during identity fallback"
                );
                Ok(Resolution::Unresolved)
            }
        }
    }

    /// Associate a customer reference with a user.
    ///
    /// A reference already held by another user is left alone and reported as
    /// [`BillingError::Conflict`].
    pub async fn link_customer(
        &self,
        user_id: &str,
        customer_ref: &str,
        email: Option<&str>,
    ) -> BillingResult<()> {
        match self.profiles.link_customer(user_id, customer_ref, email).await {
            Ok(()) => {
                tracing::info!(user_id = %user_id, customer_ref = %customer_ref, "Customer linked");
                Ok(())
            }
            Err(BillingError::Conflict {
                customer_ref,
                linked_user_id,
            }) => {
                tracing::error!(
                    user_id = %user_id,
                    customer_ref = %customer_ref,
                    linked_user_id = %linked_user_id,
                    "Identity conflict: customer already linked to another user"
                );
                Err(BillingError::Conflict {
                    customer_ref,
                    linked_user_id,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn unlink_customer(&self, customer_ref: &str) -> BillingResult<Option<String>> {
        let user_id = self.profiles.unlink_customer(customer_ref).await?;
        if let Some(user_id) = &user_id {
            tracing::info!(user_id = %user_id, customer_ref = %customer_ref, "Customer unlinked");
        }
        Ok(user_id)
    }
}
