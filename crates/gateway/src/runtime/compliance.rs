//! Compliance checking: diff a server's observed state against a pack.
//!
//! Probes are batched — one shell invocation per category — and parsed into
//! categorised mismatches. SSH failures surface as a single
//! `SshUnavailable` kind for the caller.

use std::cmp::Ordering;
use std::time::Instant;

use chrono::Utc;

use hlh_domain::compliance::{ConfigCheck, Mismatch, MismatchKind};
use hlh_domain::{Error, Result};
use hlh_packs::{ConfigPack, FileItem, PackError, PackLoader, PackageItem, SettingItem};
use hlh_ssh::SshPool;
use hlh_store::{compliance as compliance_store, servers, Store};

use crate::runtime::{resolve_ssh_access, SshAccess};
use crate::vault::Vault;

const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

pub fn map_pack_error(error: PackError) -> Error {
    match error {
        PackError::NotFound(name) => Error::not_found("pack", name),
        other => Error::Internal(other.to_string()),
    }
}

pub struct ComplianceChecker<'a> {
    pub store: &'a Store,
    pub vault: &'a Vault,
    pub pool: &'a SshPool,
    pub loader: &'a PackLoader,
}

impl ComplianceChecker<'_> {
    /// Run one check and persist the result row.
    pub async fn check(&self, server_id: &str, pack_name: &str) -> Result<ConfigCheck> {
        let started = Instant::now();
        let mut conn = self.store.acquire().await?;
        let server = servers::require(&mut conn, server_id).await?;

        let pack = self.loader.load(pack_name).map_err(map_pack_error)?;

        // Empty pack: trivially compliant, no SSH needed.
        if pack.is_empty() {
            return compliance_store::insert_check(
                &mut conn,
                &server.id,
                pack_name,
                &[],
                Utc::now(),
                started.elapsed().as_millis() as i64,
            )
            .await;
        }

        let access = resolve_ssh_access(&mut conn, self.vault, &server)
            .await
            .map_err(|e| Error::SshUnavailable(e.to_string()))?;
        drop(conn);

        let mut mismatches = Vec::new();
        if !pack.items.files.is_empty() {
            mismatches.extend(self.check_files(&access, &pack).await?);
        }
        if !pack.items.packages.is_empty() {
            mismatches.extend(self.check_packages(&access, &pack.items.packages).await?);
        }
        if !pack.items.settings.is_empty() {
            mismatches.extend(self.check_settings(&access, &pack.items.settings).await?);
        }

        let mut conn = self.store.acquire().await?;
        compliance_store::insert_check(
            &mut conn,
            &server.id,
            pack_name,
            &mismatches,
            Utc::now(),
            started.elapsed().as_millis() as i64,
        )
        .await
    }

    async fn run_probe(&self, access: &SshAccess, command: &str) -> Result<Option<String>> {
        match self
            .pool
            .execute(&access.target, &access.private_key_pem, command, PROBE_TIMEOUT)
            .await
        {
            Ok(output) => Ok(Some(output.stdout)),
            Err(e) => {
                tracing::warn!(host = %access.target.host, error = %e, "compliance probe failed");
                Ok(None)
            }
        }
    }

    async fn check_files(&self, access: &SshAccess, pack: &ConfigPack) -> Result<Vec<Mismatch>> {
        let files = &pack.items.files;
        let command = file_probe_command(files, &access.config_user, access.use_sudo);
        let Some(stdout) = self.run_probe(access, &command).await? else {
            return Ok(Vec::new());
        };
        Ok(parse_file_probe(&stdout, files))
    }

    async fn check_packages(
        &self,
        access: &SshAccess,
        packages: &[PackageItem],
    ) -> Result<Vec<Mismatch>> {
        let command = package_probe_command(packages);
        let Some(stdout) = self.run_probe(access, &command).await? else {
            return Ok(Vec::new());
        };
        Ok(parse_package_probe(&stdout, packages))
    }

    async fn check_settings(
        &self,
        access: &SshAccess,
        settings: &[SettingItem],
    ) -> Result<Vec<Mismatch>> {
        let command = settings_probe_command(settings);
        let Some(stdout) = self.run_probe(access, &command).await? else {
            return Ok(Vec::new());
        };
        Ok(parse_settings_probe(&stdout, settings))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Probe construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `~` expands to the config user's home.
pub fn expand_home(path: &str, config_user: &str) -> String {
    let home = if config_user == "root" {
        "/root".to_string()
    } else {
        format!("/home/{config_user}")
    };
    path.replacen('~', &home, 1)
}

/// One line per file: `path|EXISTS|mode|sha256`, `path|EXISTS|dir|`, or
/// `path|MISSING||`.
fn file_probe_command(files: &[FileItem], config_user: &str, use_sudo: bool) -> String {
    let sudo = if use_sudo { "sudo -n " } else { "" };
    let parts: Vec<String> = files
        .iter()
        .map(|f| {
            let path = expand_home(&f.path, config_user);
            format!(
                "path=\"{path}\"; \
                 if {sudo}test -e \"$path\"; then \
                 if {sudo}test -d \"$path\"; then \
                 echo \"$path|EXISTS|dir|\"; \
                 else \
                 mode=$({sudo}stat -c \"%a\" \"$path\" 2>/dev/null || echo \"ERROR\"); \
                 hash=$({sudo}sha256sum \"$path\" 2>/dev/null | cut -d\" \" -f1 || echo \"ERROR\"); \
                 echo \"$path|EXISTS|$mode|$hash\"; \
                 fi; \
                 else echo \"$path|MISSING||\"; fi"
            )
        })
        .collect();
    parts.join(" && ")
}

fn parse_file_probe(stdout: &str, files: &[FileItem]) -> Vec<Mismatch> {
    let mut mismatches = Vec::new();
    let lines: Vec<&str> = stdout.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        if line.is_empty() || i >= files.len() {
            continue;
        }
        let file = &files[i];
        let parts: Vec<&str> = line.split('|').collect();
        if parts.len() < 4 {
            continue;
        }
        let (exists, mode, hash) = (parts[1], parts[2], parts[3]);

        if exists == "MISSING" {
            mismatches.push(Mismatch {
                kind: MismatchKind::MissingFile,
                item: file.path.clone(),
                expected: serde_json::json!({ "exists": true, "mode": file.mode }),
                actual: serde_json::json!({ "exists": false }),
                diff: None,
            });
            continue;
        }

        // Permission comparison. Directories are skipped; so is mode 777,
        // which is how symlinks report — a real 0777 file slips through
        // (known gap).
        let is_directory = mode == "dir";
        let is_symlink = mode == "777";
        if let Some(expected_mode) = &file.mode {
            let expected_norm = expected_mode.trim_start_matches('0');
            let actual_norm = mode.trim_start_matches('0');
            if !is_directory
                && !is_symlink
                && !expected_norm.is_empty()
                && !actual_norm.is_empty()
                && expected_norm != actual_norm
            {
                mismatches.push(Mismatch {
                    kind: MismatchKind::WrongPermissions,
                    item: file.path.clone(),
                    expected: serde_json::json!({ "exists": true, "mode": expected_mode }),
                    actual: serde_json::json!({ "exists": true, "mode": mode }),
                    diff: None,
                });
            }
        }

        if let Some(content_hash) = &file.content_hash {
            let expected_hash = content_hash.strip_prefix("sha256:").unwrap_or(content_hash);
            if !hash.is_empty() && hash != "ERROR" && hash != expected_hash {
                mismatches.push(Mismatch {
                    kind: MismatchKind::WrongContent,
                    item: file.path.clone(),
                    expected: serde_json::json!({ "exists": true, "hash": content_hash }),
                    actual: serde_json::json!({ "exists": true, "hash": format!("sha256:{hash}") }),
                    diff: None,
                });
            }
        }
    }

    mismatches
}

/// Single dpkg query for every package:
/// `name<TAB>version<TAB>install_state` per line.
fn package_probe_command(packages: &[PackageItem]) -> String {
    let names: Vec<&str> = packages.iter().map(|p| p.name.as_str()).collect();
    format!(
        "dpkg-query -W -f='${{Package}}\\t${{Version}}\\t${{Status}}\\n' {} 2>/dev/null || true",
        names.join(" ")
    )
}

fn parse_package_probe(stdout: &str, packages: &[PackageItem]) -> Vec<Mismatch> {
    let mut installed = std::collections::HashMap::new();
    for line in stdout.lines() {
        let parts: Vec<&str> = line.split('\t').collect();
        if parts.len() >= 3 && parts[2].contains("install ok installed") {
            installed.insert(parts[0].to_string(), parts[1].to_string());
        }
    }

    let mut mismatches = Vec::new();
    for pkg in packages {
        match installed.get(&pkg.name) {
            None => mismatches.push(Mismatch {
                kind: MismatchKind::MissingPackage,
                item: pkg.name.clone(),
                expected: serde_json::json!({ "installed": true }),
                actual: serde_json::json!({ "installed": false }),
                diff: None,
            }),
            Some(installed_version) => {
                if let Some(min_version) = &pkg.min_version {
                    if compare_debian_versions(installed_version, min_version) == Ordering::Less {
                        mismatches.push(Mismatch {
                            kind: MismatchKind::WrongVersion,
                            item: pkg.name.clone(),
                            expected: serde_json::json!({
                                "installed": true,
                                "min_version": min_version,
                            }),
                            actual: serde_json::json!({
                                "installed": true,
                                "version": installed_version,
                            }),
                            diff: None,
                        });
                    }
                }
            }
        }
    }
    mismatches
}

/// `echo "KEY=${KEY}"` for every env-var setting, in one shot.
fn settings_probe_command(settings: &[SettingItem]) -> String {
    let parts: Vec<String> = settings
        .iter()
        .map(|s| format!("echo \"{key}=${{{key}}}\"", key = s.key))
        .collect();
    parts.join(" && ")
}

fn parse_settings_probe(stdout: &str, settings: &[SettingItem]) -> Vec<Mismatch> {
    let mut observed = std::collections::HashMap::new();
    for line in stdout.lines() {
        if let Some((key, value)) = line.split_once('=') {
            observed.insert(key.to_string(), value.to_string());
        }
    }

    let mut mismatches = Vec::new();
    for setting in settings {
        let actual = observed.get(&setting.key).cloned().unwrap_or_default();
        if actual != setting.expected {
            mismatches.push(Mismatch {
                kind: MismatchKind::WrongSetting,
                item: setting.key.clone(),
                expected: serde_json::json!({ "value": setting.expected }),
                actual: serde_json::json!({ "value": actual }),
                diff: None,
            });
        }
    }
    mismatches
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Version comparison
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Strip the epoch (`1:`) and the Debian revision (everything from the
/// first `-`, `+`, or `~`).
pub fn clean_version(version: &str) -> &str {
    let version = version.split_once(':').map(|(_, v)| v).unwrap_or(version);
    version
        .split(['-', '+', '~'])
        .next()
        .unwrap_or(version)
}

/// Segment-wise comparison of cleaned versions: numeric segments compare as
/// integers, anything else falls back to string order.
pub fn compare_debian_versions(installed: &str, required: &str) -> Ordering {
    let a = clean_version(installed);
    let b = clean_version(required);

    let mut a_parts = a.split('.');
    let mut b_parts = b.split('.');
    loop {
        match (a_parts.next(), b_parts.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let ordering = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(xn), Ok(yn)) => xn.cmp(&yn),
                    _ => x.cmp(y),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}
