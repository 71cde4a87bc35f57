//! Configuration packs: declarative bundles of files, packages, and
//! environment settings, loaded from YAML with single-parent inheritance.

mod loader;
mod model;

pub use loader::{PackError, PackLoader};
pub use model::{ConfigPack, FileItem, PackItems, PackageItem, SettingItem, SettingType};

use hlh_domain::server::MachineType;

/// Pack every server starts with. The API refuses assignments that drop it.
pub const BASE_PACK: &str = "base";

/// Default pack assignment for a newly registered machine.
pub fn default_packs_for(machine_type: MachineType) -> Vec<String> {
    match machine_type {
        MachineType::Server => vec![BASE_PACK.to_string()],
        MachineType::Workstation => vec![BASE_PACK.to_string(), "developer-lite".to_string()],
    }
}

/// Validate an operator-supplied pack assignment: non-empty, `base` first.
pub fn validate_assignment(packs: &[String]) -> Result<(), String> {
    match packs.first() {
        None => Err("pack assignment must not be empty".into()),
        Some(first) if first != BASE_PACK => {
            Err(format!("'{BASE_PACK}' must remain the first assigned pack"))
        }
        Some(_) => Ok(()),
    }
}
