use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Roles carried in the bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Admin,
    Reviewer,
    Editor,
    Viewer,
    Custom(String),
}

impl Role {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "admin" => Role::Admin,
            "reviewer" => Role::Reviewer,
            "editor" => Role::Editor,
            "viewer" => Role::Viewer,
            other => Role::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::Reviewer => "reviewer",
            Role::Editor => "editor",
            Role::Viewer => "viewer",
            Role::Custom(name) => name,
        }
    }

    /// Check if this role allows the capability at all.
    pub fn has_capability(&self, required: Capability) -> bool {
        match required {
            Capability::Read => true, // all roles can read
            Capability::Write => matches!(self, Role::Admin | Role::Reviewer | Role::Editor),
            Capability::Approve => matches!(self, Role::Admin | Role::Reviewer),
        }
    }
}

impl From<String> for Role {
    fn from(s: String) -> Self {
        Role::parse(&s)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

/// What an identity may do on a data source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Approve,
}

impl Capability {
    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Approve => "approve",
        }
    }
}

/// Scope-based access control per data source.
/// Format: "<data_source_id>:<capability>", with `*` allowed on either side
/// or alone.
pub fn check_scope(scopes: &[String], data_source_id: Uuid, capability: Capability) -> bool {
    let ds = data_source_id.to_string();
    let cap = capability.as_str();
    scopes.iter().any(|scope| {
        if scope == "*" {
            return true;
        }
        match scope.split_once(':') {
            Some((s_ds, s_cap)) => (s_ds == "*" || s_ds == ds) && (s_cap == "*" || s_cap == cap),
            None => false,
        }
    })
}

/// The authenticated caller, decoded from the bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub role: Role,
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, role: Role, scopes: Vec<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            scopes,
        }
    }

    /// Check if the caller may use `capability` on the data source.
    pub fn can(&self, capability: Capability, data_source_id: Uuid) -> bool {
        if !self.role.has_capability(capability) {
            return false;
        }
        // Admin role bypasses scope checks
        self.role == Role::Admin || check_scope(&self.scopes, data_source_id, capability)
    }

    /// Check both role and scope. Returns the denial reason on failure.
    pub fn require(&self, capability: Capability, data_source_id: Uuid) -> Result<(), String> {
        if !self.role.has_capability(capability) {
            return Err(format!(
                "role '{}' cannot {} on any data source",
                self.role.as_str(),
                capability.as_str()
            ));
        }
        if !self.can(capability, data_source_id) {
            tracing::warn!(
                user_id = %self.user_id,
                role = self.role.as_str(),
                %data_source_id,
                capability = capability.as_str(),
                "access denied"
            );
            return Err(format!(
                "missing scope '{}:{}'",
                data_source_id,
                capability.as_str()
            ));
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────
