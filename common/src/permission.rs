use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::Role;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PermissionError {
    #[error("permission blob is not a JSON object")]
    NotAnObject,
    #[error("invalid value for permission key '{0}'")]
    InvalidValue(String),
}

/// A single grant. Roles carry a list of these, stored as a JSON object
/// (see [`permissions_from_value`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Permission {
    SuperAdmin,
    Impersonate,
    Deployer,
    ReadAllEnvironments,
    Read(i64),
    DeployBusinessHours(i64),
    Deploy(i64),
    Default,
}

impl Permission {
    /// The grant lattice. SuperAdmin implies everything; Impersonate implies
    /// reading everywhere; per-environment grants chain
    /// Deploy ⇒ DeployBusinessHours ⇒ Read ⇒ Default within one environment.
    pub fn implies(&self, other: &Permission) -> bool {
        use Permission::*;

        match self {
            SuperAdmin => true,
            Impersonate => matches!(other, Impersonate) || ReadAllEnvironments.implies(other),
            Deployer => matches!(other, Deployer | Default),
            ReadAllEnvironments => matches!(other, ReadAllEnvironments | Read(_) | Default),
            Deploy(env) => {
                matches!(other, Deploy(o) if o == env) || DeployBusinessHours(*env).implies(other)
            }
            DeployBusinessHours(env) => {
                matches!(other, DeployBusinessHours(o) if o == env) || Read(*env).implies(other)
            }
            Read(env) => matches!(other, Read(o) if o == env) || matches!(other, Default),
            Default => matches!(other, Default),
        }
    }

    pub fn readable_environments(&self) -> Vec<i64> {
        match self {
            Permission::Read(env)
            | Permission::DeployBusinessHours(env)
            | Permission::Deploy(env) => vec![*env],
            _ => Vec::new(),
        }
    }
}

impl Role {
    pub fn parsed_permissions(&self) -> Result<Vec<Permission>, PermissionError> {
        let value: Value = serde_json::from_str(&self.permissions)
            .map_err(|_| PermissionError::NotAnObject)?;
        permissions_from_value(&value)
    }

    pub fn allows(&self, wanted: &Permission) -> bool {
        self.parsed_permissions()
            .map(|perms| perms.iter().any(|p| p.implies(wanted)))
            .unwrap_or(false)
    }
}

/// Whether any of the given roles grants `wanted`.
pub fn roles_allow(roles: &[Role], wanted: &Permission) -> bool {
    roles.iter().any(|role| role.allows(wanted))
}

/// Environments readable through any of the given roles. Callers should test
/// for [`Permission::ReadAllEnvironments`] first.
pub fn readable_environments(roles: &[Role]) -> Vec<i64> {
    let mut envs: Vec<i64> = roles
        .iter()
        .filter_map(|role| role.parsed_permissions().ok())
        .flatten()
        .flat_map(|p| p.readable_environments())
        .collect();
    envs.sort_unstable();
    envs.dedup();
    envs
}

fn env_ids(key: &str, value: &Value) -> Result<Vec<i64>, PermissionError> {
    value
        .as_array()
        .ok_or_else(|| PermissionError::InvalidValue(key.to_owned()))?
        .iter()
        .map(|id| {
            id.as_i64()
                .ok_or_else(|| PermissionError::InvalidValue(key.to_owned()))
        })
        .collect()
}

/// Parse the role blob. Recognized keys: `admin`, `impersonate`, `deployer`
/// (booleans) and `read`, `deploy_business_hours`, `deploy` (environment id
/// lists). Unknown keys are rejected so typos in role edits surface early.
pub fn permissions_from_value(value: &Value) -> Result<Vec<Permission>, PermissionError> {
    let object = value.as_object().ok_or(PermissionError::NotAnObject)?;
    let mut permissions = Vec::new();

    for (key, value) in object {
        match key.as_str() {
            "admin" | "impersonate" | "deployer" => {
                let granted = value
                    .as_bool()
                    .ok_or_else(|| PermissionError::InvalidValue(key.clone()))?;
                if granted {
                    permissions.push(match key.as_str() {
                        "admin" => Permission::SuperAdmin,
                        "impersonate" => Permission::Impersonate,
                        _ => Permission::Deployer,
                    });
                }
            }
            "read" => {
                for env in env_ids(key, value)? {
                    permissions.push(Permission::Read(env));
                }
            }
            "deploy_business_hours" => {
                for env in env_ids(key, value)? {
                    permissions.push(Permission::DeployBusinessHours(env));
                }
            }
            "deploy" => {
                for env in env_ids(key, value)? {
                    permissions.push(Permission::Deploy(env));
                }
            }
            _ => return Err(PermissionError::InvalidValue(key.clone())),
        }
    }

    Ok(permissions)
}

/// Render a permission list back into the role blob shape. Environment lists
/// come out sorted and deduplicated, so `permissions_to_value ∘
/// permissions_from_value` is the identity on normalized blobs.
pub fn permissions_to_value(permissions: &[Permission]) -> Value {
    let mut object = Map::new();
    let mut read = Vec::new();
    let mut business_hours = Vec::new();
    let mut deploy = Vec::new();

    for permission in permissions {
        match permission {
            Permission::SuperAdmin => {
                object.insert("admin".into(), Value::Bool(true));
            }
            Permission::Impersonate => {
                object.insert("impersonate".into(), Value::Bool(true));
            }
            Permission::Deployer => {
                object.insert("deployer".into(), Value::Bool(true));
            }
            Permission::Read(env) => read.push(*env),
            Permission::DeployBusinessHours(env) => business_hours.push(*env),
            Permission::Deploy(env) => deploy.push(*env),
            // Not representable in the blob: ReadAllEnvironments is only ever
            // derived, Default is the empty grant.
            Permission::ReadAllEnvironments | Permission::Default => {}
        }
    }

    for (key, mut envs) in [
        ("read", read),
        ("deploy_business_hours", business_hours),
        ("deploy", deploy),
    ] {
        if !envs.is_empty() {
            envs.sort_unstable();
            envs.dedup();
            object.insert(key.into(), envs.into_iter().map(Value::from).collect());
        }
    }

    Value::Object(object)
}
