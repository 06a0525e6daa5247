//! Generated names for provider instances.
//!
//! The provider only knows instances by name, so the hatchery encodes a
//! little intent into names: pool instances start with `provision-`, model
//! registration instances with `register-{model}`, and a model build in
//! progress uses the scratch name `{model}-tmp`.

use crate::Ulid;

/// Prefix of provisioning-pool instances that no worker has claimed yet.
pub const PROVISION_PREFIX: &str = "provision-";

/// Prefix of model registration instances.
pub const REGISTER_PREFIX: &str = "register-";

/// Suffix of the scratch instance used while building a model template.
pub const TMP_SUFFIX: &str = "-tmp";

fn suffix() -> String {
    Ulid::new().to_string().to_lowercase()
}

/// Name for a fresh worker instance of `model`.
pub fn worker_name(model: &str) -> String {
    format!("{}-{}", sanitize(model), suffix())
}

/// Name for a fresh provisioning-pool instance.
pub fn provision_name() -> String {
    format!("{}{}", PROVISION_PREFIX, suffix())
}

/// Name for a registration instance of `model`.
pub fn register_name(model: &str) -> String {
    format!("{}{}-{}", REGISTER_PREFIX, sanitize(model), suffix())
}

/// Scratch name used while a template for `model` is being built.
pub fn tmp_name(model: &str) -> String {
    format!("{}{}", sanitize(model), TMP_SUFFIX)
}

/// Returns true for pool instances that have not been claimed.
pub fn is_provision_name(name: &str) -> bool {
    name.starts_with(PROVISION_PREFIX)
}

/// Returns true for registration instances of any model.
pub fn is_register_name(name: &str) -> bool {
    name.starts_with(REGISTER_PREFIX)
}

/// Returns true when `name` marks a registration or template build in
/// flight for `model`.
pub fn is_transient_for_model(name: &str, model: &str) -> bool {
    let model = sanitize(model);
    name == tmp_name(&model) || name.starts_with(&format!("{}{}", REGISTER_PREFIX, model))
}

/// Lowercases a model name and replaces characters providers commonly
/// refuse in instance names.
pub fn sanitize(model: &str) -> String {
    model
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect()
}
