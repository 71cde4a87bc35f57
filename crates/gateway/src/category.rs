//! Machine-category inference from CPU model and architecture.
//!
//! First-match rule list; order matters. Desktop tiers only match when the
//! model carries no mobile marker, so a mobile Ryzen 7 lands on
//! `office_laptop` rather than `workstation`.

use regex::Regex;
use std::sync::OnceLock;

use hlh_domain::server::MachineCategory;

const ARM_ARCHITECTURES: &[&str] = &["aarch64", "armv6l", "armv7l", "arm64"];

fn intel_tier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // e.g. "i5-8250U", "i7 9700K", "Core(TM) i9-13900"
    RE.get_or_init(|| Regex::new(r"\bi([3579])[- ]?(\d{3,5})([A-Z]*)").expect("static regex"))
}

fn ryzen_tier_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // e.g. "Ryzen 7 5800X", "Ryzen 5 PRO 4650U"
    RE.get_or_init(|| {
        Regex::new(r"Ryzen\s+([3579])(?:\s+PRO)?\s+(\d{3,5})([A-Z]*)").expect("static regex")
    })
}

fn intel_n_series_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // e.g. "N100", "N5105"
    RE.get_or_init(|| Regex::new(r"\bN\d{2,4}\b").expect("static regex"))
}

/// Mobile markers: Intel U/P/H/Y model suffixes, AMD U-suffix or explicit
/// "Mobile", Apple Silicon.
fn is_mobile(cpu_model: &str) -> bool {
    if cpu_model.contains("Apple M") || cpu_model.contains("Mobile") {
        return true;
    }
    if let Some(captures) = intel_tier_regex().captures(cpu_model) {
        let suffix = captures.get(3).map(|m| m.as_str()).unwrap_or("");
        if suffix.starts_with('U')
            || suffix.starts_with('P')
            || suffix.starts_with('H')
            || suffix.starts_with('Y')
        {
            return true;
        }
    }
    if let Some(captures) = ryzen_tier_regex().captures(cpu_model) {
        let suffix = captures.get(3).map(|m| m.as_str()).unwrap_or("");
        if suffix.starts_with('U') {
            return true;
        }
    }
    false
}

fn desktop_tier(cpu_model: &str) -> Option<u8> {
    if let Some(captures) = intel_tier_regex().captures(cpu_model) {
        return captures[1].parse().ok();
    }
    if let Some(captures) = ryzen_tier_regex().captures(cpu_model) {
        return captures[1].parse().ok();
    }
    None
}

/// Deterministic inference rules. Returns `None` when no rule matches; the
/// category is then left unset rather than guessed.
pub fn infer_category(
    cpu_model: Option<&str>,
    architecture: Option<&str>,
) -> Option<MachineCategory> {
    if let Some(arch) = architecture {
        if ARM_ARCHITECTURES.contains(&arch) {
            return Some(MachineCategory::Sbc);
        }
    }

    let model = cpu_model?;

    if model.contains("Xeon") || model.contains("EPYC") {
        return Some(MachineCategory::RackServer);
    }
    if model.contains("Threadripper") {
        return Some(MachineCategory::Workstation);
    }

    let mobile = is_mobile(model);
    if let Some(tier) = desktop_tier(model) {
        if !mobile {
            return match tier {
                7 | 9 => Some(MachineCategory::Workstation),
                3 | 5 => Some(MachineCategory::OfficeDesktop),
                _ => None,
            };
        }
    }
    if mobile {
        return Some(MachineCategory::OfficeLaptop);
    }

    if intel_n_series_regex().is_match(model)
        || model.contains("Celeron")
        || model.contains("Atom")
        || model.contains("Pentium")
    {
        return Some(MachineCategory::MiniPc);
    }

    None
}
