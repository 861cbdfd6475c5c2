use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

pub mod canonical;

/// Role vocabulary shared with the role-management subsystem. The wire
/// names are fixed; anything else confers no access anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    SuperAdmin,
    SystemAdministrator,
    ProgramManager,
    SubProjectManager,
    FieldOperator,
}

impl Role {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "SUPER_ADMIN" => Some(Role::SuperAdmin),
            "SYSTEM_ADMINISTRATOR" => Some(Role::SystemAdministrator),
            "PROGRAM_MANAGER" => Some(Role::ProgramManager),
            "SUB_PROJECT_MANAGER" => Some(Role::SubProjectManager),
            "FIELD_OPERATOR" => Some(Role::FieldOperator),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::SuperAdmin => "SUPER_ADMIN",
            Role::SystemAdministrator => "SYSTEM_ADMINISTRATOR",
            Role::ProgramManager => "PROGRAM_MANAGER",
            Role::SubProjectManager => "SUB_PROJECT_MANAGER",
            Role::FieldOperator => "FIELD_OPERATOR",
        }
    }
}

/// Parse a list of role names, dropping anything outside the closed set.
pub fn parse_role_names<'a, I>(names: I) -> BTreeSet<Role>
where
    I: IntoIterator<Item = &'a str>,
{
    names
        .into_iter()
        .filter_map(|name| Role::from_name(name.trim()))
        .collect()
}

/// Level of the program containment chain an entity reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Project,
    Subproject,
    Activity,
}

impl EntityType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "project" => Some(EntityType::Project),
            "subproject" => Some(EntityType::Subproject),
            "activity" => Some(EntityType::Activity),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Project => "project",
            EntityType::Subproject => "subproject",
            EntityType::Activity => "activity",
        }
    }
}

/// An `(entity_id, entity_type)` pair as carried by beneficiary and
/// service-delivery rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    pub entity_id: String,
    pub entity_type: EntityType,
}

impl EntityRef {
    pub fn new(entity_id: impl Into<String>, entity_type: EntityType) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type,
        }
    }
}

/// Level at which the ids of an [`EntityFilter::ByEntityIds`] filter live.
/// Program managers are scoped by project ids, subproject managers by
/// subproject ids; membership tests resolve rows up to exactly this level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeLevel {
    Project,
    Subproject,
}

/// Role-derived visibility scope for one principal. Computed fresh per
/// request; an empty id set means zero rows, never "no restriction".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityFilter {
    Unrestricted,
    ByEntityIds {
        level: ScopeLevel,
        ids: BTreeSet<String>,
    },
    BySelfStaffId(String),
}

impl EntityFilter {
    pub fn no_access() -> Self {
        EntityFilter::ByEntityIds {
            level: ScopeLevel::Project,
            ids: BTreeSet::new(),
        }
    }
}

pub const ENVELOPE_ALGORITHM: &str = "aes-256-gcm";

/// Structured ciphertext stored in place of a plaintext PII attribute.
/// All fields are lowercase hex. The envelope is returned to callers as-is
/// whether or not they may decrypt; only plaintext is gated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherEnvelope {
    pub algorithm: String,
    pub iv: String,
    pub auth_tag: String,
    pub ciphertext: String,
}

/// One optional envelope per protected beneficiary attribute. A NULL
/// column decrypts to a null plaintext, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiEnvelopes {
    pub first_name: Option<CipherEnvelope>,
    pub last_name: Option<CipherEnvelope>,
    pub date_of_birth: Option<CipherEnvelope>,
    pub national_id: Option<CipherEnvelope>,
    pub phone: Option<CipherEnvelope>,
    pub email: Option<CipherEnvelope>,
    pub address: Option<CipherEnvelope>,
}

/// Decrypted counterpart of [`PiiEnvelopes`]. Only ever serialized for
/// principals the PII gate admits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PiiPlain {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<String>,
    pub national_id: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
}

/// A beneficiary row as loaded from the directory, PII still sealed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeneficiaryRecord {
    pub beneficiary_id: String,
    pub pseudonym: String,
    pub status: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub staff_user_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub pii_enc: PiiEnvelopes,
}

impl BeneficiaryRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_id.clone(), self.entity_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDeliveryRecord {
    pub delivery_id: String,
    pub beneficiary_id: String,
    pub service_id: String,
    pub entity_id: String,
    pub entity_type: EntityType,
    pub staff_user_id: String,
    pub delivered_at: String,
}

impl ServiceDeliveryRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::new(self.entity_id.clone(), self.entity_type)
    }
}
