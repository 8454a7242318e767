//! Per-family convergence units.

use metrics::counter;
use tracing::{info, warn};

use tether_consul::{ControlPlane, ControlPlaneError};
use tether_core::{Credential, CredentialRequest, SecretRecord, WorkloadFamily};
use tether_kubehub::SecretStore;

use crate::FamilyError;

/// Collaborators shared by every resource in one pass.
#[derive(Clone, Copy)]
pub struct ConvergeCtx<'a> {
    pub control_plane: &'a dyn ControlPlane,
    pub secrets: &'a dyn SecretStore,
    pub secret_prefix: &'a str,
}

/// What converging a resource changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The recorded credential is live. `revoked` duplicates were deleted.
    Converged { revoked: usize },
    /// An unrecorded live credential was written into the record.
    Adopted { revoked: usize },
    Created,
    Revoked { credentials: usize },
}

/// A family that should hold a credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FamilyResource {
    pub family: WorkloadFamily,
    /// Live owned credentials for the family at listing time.
    pub existing: Vec<Credential>,
}

/// A family that holds credentials but has no running instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanResource {
    pub family: WorkloadFamily,
    pub credentials: Vec<Credential>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileResource {
    Upsert(FamilyResource),
    Revoke(OrphanResource),
}

impl ReconcileResource {
    pub fn family(&self) -> &WorkloadFamily {
        match self {
            ReconcileResource::Upsert(r) => &r.family,
            ReconcileResource::Revoke(r) => &r.family,
        }
    }

    /// Idempotent: converging an already converged resource changes nothing.
    pub async fn converge(&self, ctx: ConvergeCtx<'_>) -> Result<Outcome, FamilyError> {
        match self {
            ReconcileResource::Upsert(r) => r.converge(ctx).await,
            ReconcileResource::Revoke(r) => r.converge(ctx).await,
        }
    }
}

async fn delete_tolerant(ctx: ConvergeCtx<'_>, family: &WorkloadFamily, accessor_id: &str) -> Result<(), FamilyError> {
    match ctx.control_plane.delete_credential(accessor_id).await {
        Ok(()) => {
            info!(%family, accessor = %accessor_id, "credential deleted");
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            info!(%family, accessor = %accessor_id, "credential already gone");
            Ok(())
        }
        Err(source) => Err(FamilyError::Delete { family: family.clone(), accessor: accessor_id.to_string(), source }),
    }
}

async fn write_record(ctx: ConvergeCtx<'_>, family: &WorkloadFamily, record: &SecretRecord) -> Result<(), FamilyError> {
    let secret = family.secret_name(ctx.secret_prefix);
    ctx.secrets
        .put(&secret, &record.to_bytes())
        .await
        .map_err(|source| FamilyError::SecretWrite { family: family.clone(), secret: secret.clone(), source })?;
    info!(%family, %secret, "secret updated");
    Ok(())
}

impl FamilyResource {
    async fn read_record(&self, ctx: ConvergeCtx<'_>) -> Result<SecretRecord, FamilyError> {
        let secret = self.family.secret_name(ctx.secret_prefix);
        let raw = ctx
            .secrets
            .get(&secret)
            .await
            .map_err(|source| FamilyError::SecretRead { family: self.family.clone(), secret: secret.clone(), source })?;
        match raw {
            None => Ok(SecretRecord::empty()),
            Some(bytes) => SecretRecord::parse(&bytes)
                .map_err(|source| FamilyError::SecretDecode { family: self.family.clone(), secret, source }),
        }
    }

    /// `Ok(None)` when the accessor no longer exists.
    async fn read_live(&self, ctx: ConvergeCtx<'_>, accessor_id: &str) -> Result<Option<Credential>, FamilyError> {
        match ctx.control_plane.read_credential(accessor_id).await {
            Ok(c) => Ok(Some(c)),
            Err(ControlPlaneError::NotFound(_)) => Ok(None),
            Err(source) => Err(FamilyError::ReadCredential {
                family: self.family.clone(),
                accessor: accessor_id.to_string(),
                source,
            }),
        }
    }

    /// Delete every known credential except `keep`.
    async fn revoke_extras(&self, ctx: ConvergeCtx<'_>, keep: &str) -> Result<usize, FamilyError> {
        let mut revoked = 0;
        for c in self.existing.iter().filter(|c| c.accessor_id != keep) {
            delete_tolerant(ctx, &self.family, &c.accessor_id).await?;
            revoked += 1;
        }
        if revoked > 0 {
            counter!("controller_credentials_revoked_total", revoked as u64);
        }
        Ok(revoked)
    }

    async fn converge(&self, ctx: ConvergeCtx<'_>) -> Result<Outcome, FamilyError> {
        let family = &self.family;
        let record = self.read_record(ctx).await?;

        if !record.accessor_id.is_empty() {
            match self.read_live(ctx, &record.accessor_id).await? {
                Some(live) if live.owned_family().as_ref() == Some(family) => {
                    info!(%family, accessor = %record.accessor_id, "credential already exists; skipping creation");
                    let revoked = self.revoke_extras(ctx, &record.accessor_id).await?;
                    return Ok(Outcome::Converged { revoked });
                }
                // Not ours: leave it alone and replace the record.
                Some(_) => {
                    warn!(%family, accessor = %record.accessor_id, "recorded credential belongs to another identity; replacing record")
                }
                None => info!(%family, accessor = %record.accessor_id, "recorded credential not found; issuing a new one"),
            }
        }

        for candidate in self.existing.iter().filter(|c| c.accessor_id != record.accessor_id) {
            if let Some(live) = self.read_live(ctx, &candidate.accessor_id).await? {
                info!(%family, accessor = %live.accessor_id, "adopting unrecorded credential");
                write_record(ctx, family, &SecretRecord::for_credential(&live)).await?;
                counter!("controller_credentials_adopted_total", 1u64);
                let revoked = self.revoke_extras(ctx, &live.accessor_id).await?;
                return Ok(Outcome::Adopted { revoked });
            }
        }

        info!(%family, "creating credential");
        let cred = ctx
            .control_plane
            .create_credential(&CredentialRequest::for_family(family))
            .await
            .map_err(|source| FamilyError::Create { family: family.clone(), source })?;
        counter!("controller_credentials_created_total", 1u64);
        info!(%family, accessor = %cred.accessor_id, "credential created");
        if let Err(e) = write_record(ctx, family, &SecretRecord::for_credential(&cred)).await {
            warn!(%family, accessor = %cred.accessor_id, "credential created but not recorded; next pass adopts it");
            return Err(e);
        }
        Ok(Outcome::Created)
    }
}

impl OrphanResource {
    async fn converge(&self, ctx: ConvergeCtx<'_>) -> Result<Outcome, FamilyError> {
        let family = &self.family;
        for c in &self.credentials {
            delete_tolerant(ctx, family, &c.accessor_id).await?;
        }
        counter!("controller_credentials_revoked_total", self.credentials.len() as u64);
        if let Err(e) = write_record(ctx, family, &SecretRecord::empty()).await {
            warn!(%family, error = %e, "credentials deleted but secret still references one; requires cleanup");
            return Err(e);
        }
        Ok(Outcome::Revoked { credentials: self.credentials.len() })
    }
}
