//! Config-apply engine: dry-run previews, background application with
//! progress tracking, and pack removal with backups.
//!
//! The `ConfigApply` row is the single source of truth for a run; the
//! background worker is bound to it, not to the originating request, and
//! commits progress after every item.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::RngCore;
use serde::Serialize;

use hlh_domain::compliance::{ApplyItemResult, ApplyStatus, ConfigApply, REMOVAL_BACKUP_SUFFIX};
use hlh_domain::{Error, Result};
use hlh_packs::{ConfigPack, PackLoader};
use hlh_ssh::SshPool;
use hlh_store::{compliance as compliance_store, servers, Store};

use crate::runtime::compliance::{expand_home, map_pack_error};
use crate::runtime::{resolve_ssh_access, SshAccess};
use crate::vault::Vault;

const APPLY_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Preview types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct PreviewItem {
    pub item: String,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyPreview {
    pub server_id: String,
    pub pack_name: String,
    pub files: Vec<PreviewItem>,
    pub packages: Vec<PreviewItem>,
    pub settings: Vec<PreviewItem>,
    pub total_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemovePreview {
    pub server_id: String,
    pub pack_name: String,
    /// Files renamed to `{path}.homelabcmd.bak`, never deleted outright.
    pub files: Vec<PreviewItem>,
    /// Packages are left installed; removal could break dependents.
    pub packages_skipped: Vec<String>,
    pub settings: Vec<PreviewItem>,
    pub total_items: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveOutcome {
    pub server_id: String,
    pub pack_name: String,
    pub results: Vec<ApplyItemResult>,
    pub packages_skipped: Vec<String>,
    pub success: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Owns clones of everything the background worker needs, so a run survives
/// its originating request.
#[derive(Clone)]
pub struct ApplyEngine {
    store: Store,
    vault: Arc<Vault>,
    pool: Arc<SshPool>,
    loader: Arc<PackLoader>,
}

impl ApplyEngine {
    pub fn new(store: Store, vault: Arc<Vault>, pool: Arc<SshPool>, loader: Arc<PackLoader>) -> Self {
        Self {
            store,
            vault,
            pool,
            loader,
        }
    }

    /// Dry-run: the grouped list of proposed actions, no side effects.
    pub async fn preview(&self, server_id: &str, pack_name: &str) -> Result<ApplyPreview> {
        let mut conn = self.store.acquire().await?;
        servers::require(&mut conn, server_id).await?;
        let pack = self.loader.load(pack_name).map_err(map_pack_error)?;

        let files = pack
            .items
            .files
            .iter()
            .map(|f| PreviewItem {
                item: f.path.clone(),
                action: "write_file".into(),
                description: f.description.clone(),
            })
            .collect::<Vec<_>>();
        let packages = pack
            .items
            .packages
            .iter()
            .map(|p| PreviewItem {
                item: p.name.clone(),
                action: "install_package".into(),
                description: p.description.clone(),
            })
            .collect::<Vec<_>>();
        let settings = pack
            .items
            .settings
            .iter()
            .map(|s| PreviewItem {
                item: s.key.clone(),
                action: "set_env_var".into(),
                description: s.description.clone(),
            })
            .collect::<Vec<_>>();

        let total_items = files.len() + packages.len() + settings.len();
        Ok(ApplyPreview {
            server_id: server_id.to_string(),
            pack_name: pack_name.to_string(),
            files,
            packages,
            settings,
            total_items,
        })
    }

    /// Create the apply row and spawn the background worker. `409` when a
    /// non-terminal apply already exists for the server.
    pub async fn start(
        &self,
        server_id: &str,
        pack_name: &str,
        triggered_by: &str,
    ) -> Result<ConfigApply> {
        let mut conn = self.store.acquire().await?;
        servers::require(&mut conn, server_id).await?;
        let pack = self.loader.load(pack_name).map_err(map_pack_error)?;

        if let Some(running) = compliance_store::non_terminal_apply(&mut conn, server_id).await? {
            return Err(Error::Conflict(format!(
                "apply {} is already {} for server {server_id}",
                running.id,
                match running.status {
                    ApplyStatus::Pending => "pending",
                    _ => "running",
                }
            )));
        }

        let apply = compliance_store::insert_apply(
            &mut conn,
            server_id,
            pack_name,
            pack.item_count() as i64,
            triggered_by,
        )
        .await?;
        drop(conn);

        let engine = self.clone();
        let apply_id = apply.id;
        tokio::spawn(async move {
            engine.run(apply_id).await;
        });

        Ok(apply)
    }

    /// Worker body. Never panics the process: any error marks the row
    /// failed.
    pub async fn run(&self, apply_id: i64) {
        if let Err(e) = self.run_inner(apply_id).await {
            tracing::error!(apply_id, error = %e, "background apply failed");
            if let Err(update_err) = self.mark_failed(apply_id, &e.to_string()).await {
                tracing::error!(apply_id, error = %update_err, "failed to record apply failure");
            }
        }
    }

    async fn run_inner(&self, apply_id: i64) -> Result<()> {
        let mut conn = self.store.acquire().await?;
        let mut apply = compliance_store::require_apply(&mut conn, apply_id).await?;
        if apply.status != ApplyStatus::Pending {
            tracing::warn!(apply_id, status = ?apply.status, "apply is not pending, skipping");
            return Ok(());
        }

        let server = servers::require(&mut conn, &apply.server_id).await?;
        let pack = self.loader.load(&apply.pack_name).map_err(map_pack_error)?;
        let access = resolve_ssh_access(&mut conn, &self.vault, &server)
            .await
            .map_err(|e| Error::SshUnavailable(e.to_string()))?;

        apply.status = ApplyStatus::Running;
        compliance_store::update_apply(&mut conn, &apply).await?;
        drop(conn);

        // Work through items in declaration order: files, packages,
        // settings. Per-item failures are recorded and the run continues.
        let steps = self.build_steps(&pack, &access);
        let total = steps.len().max(1);

        for (index, step) in steps.iter().enumerate() {
            // Progress is committed before each item so pollers see the
            // current one.
            {
                let mut conn = self.store.acquire().await?;
                apply.current_item = Some(step.item.clone());
                apply.progress = ((index * 100) / total) as i64;
                compliance_store::update_apply(&mut conn, &apply).await?;
            }

            let result = match &step.kind {
                StepKind::Run(command) => self.run_command(&access, command).await,
                StepKind::Fail(message) => Err(message.clone()),
            };
            match &result {
                Ok(()) => {
                    apply.items_completed += 1;
                    apply.results.0.push(ApplyItemResult {
                        item: step.item.clone(),
                        action: step.action.clone(),
                        success: true,
                        error: None,
                    });
                }
                Err(message) => {
                    apply.items_failed += 1;
                    apply.results.0.push(ApplyItemResult {
                        item: step.item.clone(),
                        action: step.action.clone(),
                        success: false,
                        error: Some(message.clone()),
                    });
                    tracing::warn!(
                        apply_id,
                        item = %step.item,
                        error = %message,
                        "apply item failed, continuing"
                    );
                }
            }

            let mut conn = self.store.acquire().await?;
            apply.progress = (((index + 1) * 100) / total) as i64;
            compliance_store::update_apply(&mut conn, &apply).await?;
        }

        // Partial-failure policy: failed only when nothing succeeded.
        apply.status = if apply.items_completed == 0 && apply.items_failed > 0 {
            ApplyStatus::Failed
        } else {
            ApplyStatus::Completed
        };
        apply.progress = 100;
        apply.current_item = None;
        apply.completed_at = Some(Utc::now());

        let mut conn = self.store.acquire().await?;
        compliance_store::update_apply(&mut conn, &apply).await?;
        tracing::info!(
            apply_id,
            completed = apply.items_completed,
            failed = apply.items_failed,
            status = ?apply.status,
            "apply finished"
        );
        Ok(())
    }

    async fn mark_failed(&self, apply_id: i64, error: &str) -> Result<()> {
        let mut conn = self.store.acquire().await?;
        let mut apply = compliance_store::require_apply(&mut conn, apply_id).await?;
        apply.status = ApplyStatus::Failed;
        apply.error = Some(error.to_string());
        apply.completed_at = Some(Utc::now());
        compliance_store::update_apply(&mut conn, &apply).await
    }

    async fn run_command(
        &self,
        access: &SshAccess,
        command: &str,
    ) -> std::result::Result<(), String> {
        let output = self
            .pool
            .execute(
                &access.target,
                &access.private_key_pem,
                command,
                APPLY_COMMAND_TIMEOUT,
            )
            .await
            .map_err(|e| e.to_string())?;
        if output.exit_code != 0 {
            let stderr = output.stderr.trim();
            return Err(if stderr.is_empty() {
                format!("exit code {}", output.exit_code)
            } else {
                format!("exit code {}: {stderr}", output.exit_code)
            });
        }
        Ok(())
    }

    // ── Removal ──────────────────────────────────────────────────────

    pub async fn remove_preview(&self, server_id: &str, pack_name: &str) -> Result<RemovePreview> {
        let mut conn = self.store.acquire().await?;
        servers::require(&mut conn, server_id).await?;
        let pack = self.loader.load(pack_name).map_err(map_pack_error)?;

        let files = pack
            .items
            .files
            .iter()
            .map(|f| PreviewItem {
                item: f.path.clone(),
                action: "backup_file".into(),
                description: Some(format!("renamed to {}{REMOVAL_BACKUP_SUFFIX}", f.path)),
            })
            .collect::<Vec<_>>();
        let settings = pack
            .items
            .settings
            .iter()
            .map(|s| PreviewItem {
                item: s.key.clone(),
                action: "remove_env_var".into(),
                description: s.description.clone(),
            })
            .collect::<Vec<_>>();
        let packages_skipped: Vec<String> =
            pack.items.packages.iter().map(|p| p.name.clone()).collect();

        let total_items = files.len() + settings.len();
        Ok(RemovePreview {
            server_id: server_id.to_string(),
            pack_name: pack_name.to_string(),
            files,
            packages_skipped,
            settings,
            total_items,
        })
    }

    /// Execute removal: files become `{path}.homelabcmd.bak`, env vars drop
    /// out of the rc file, packages stay installed.
    pub async fn remove(&self, server_id: &str, pack_name: &str) -> Result<RemoveOutcome> {
        let mut conn = self.store.acquire().await?;
        let server = servers::require(&mut conn, server_id).await?;
        let pack = self.loader.load(pack_name).map_err(map_pack_error)?;
        let access = resolve_ssh_access(&mut conn, &self.vault, &server)
            .await
            .map_err(|e| Error::SshUnavailable(e.to_string()))?;
        drop(conn);

        let mut results = Vec::new();

        for file in &pack.items.files {
            let path = expand_home(&file.path, &access.config_user);
            let sudo = sudo_prefix(&access);
            let command = format!(
                "if {sudo}test -e \"{path}\"; then {sudo}mv \"{path}\" \"{path}{REMOVAL_BACKUP_SUFFIX}\"; fi"
            );
            let outcome = self.run_command(&access, &command).await;
            results.push(ApplyItemResult {
                item: file.path.clone(),
                action: "backup_file".into(),
                success: outcome.is_ok(),
                error: outcome.err(),
            });
        }

        let rc_file = expand_home("~/.bashrc", &access.config_user);
        for setting in &pack.items.settings {
            let sudo = sudo_prefix(&access);
            let command = format!(
                "if {sudo}test -f \"{rc_file}\"; then {sudo}sed -i '/^export {key}=/d' \"{rc_file}\"; fi",
                key = setting.key
            );
            let outcome = self.run_command(&access, &command).await;
            results.push(ApplyItemResult {
                item: setting.key.clone(),
                action: "remove_env_var".into(),
                success: outcome.is_ok(),
                error: outcome.err(),
            });
        }

        let packages_skipped: Vec<String> =
            pack.items.packages.iter().map(|p| p.name.clone()).collect();
        let success = results.iter().all(|r| r.success);

        Ok(RemoveOutcome {
            server_id: server_id.to_string(),
            pack_name: pack_name.to_string(),
            results,
            packages_skipped,
            success,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Step construction
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Step {
    item: String,
    action: String,
    kind: StepKind,
}

/// A step either runs a remote command or was already known to fail when the
/// plan was built (e.g. a file item with no template to write).
enum StepKind {
    Run(String),
    Fail(String),
}

fn sudo_prefix(access: &SshAccess) -> &'static str {
    if access.use_sudo {
        "sudo -n "
    } else {
        ""
    }
}

fn heredoc_sentinel() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("HLH_EOF_{}", hex::encode(bytes))
}

impl ApplyEngine {
    fn build_steps(&self, pack: &ConfigPack, access: &SshAccess) -> Vec<Step> {
        let mut steps = Vec::new();
        let sudo = sudo_prefix(access);

        for file in &pack.items.files {
            let path = expand_home(&file.path, &access.config_user);
            let kind = match &file.template {
                Some(template) => match self.resolve_template(template) {
                    Ok(content) => {
                        StepKind::Run(write_file_command(&path, file.mode.as_deref(), &content, sudo))
                    }
                    Err(message) => StepKind::Fail(message),
                },
                None => StepKind::Fail(format!("no template declared for {}", file.path)),
            };
            steps.push(Step {
                item: file.path.clone(),
                action: "write_file".into(),
                kind,
            });
        }

        for package in &pack.items.packages {
            steps.push(Step {
                item: package.name.clone(),
                action: "install_package".into(),
                kind: StepKind::Run(format!(
                    "sudo -n apt-get install -y {name} 2>&1 | tail -n 5",
                    name = package.name
                )),
            });
        }

        let rc_file = expand_home("~/.bashrc", &access.config_user);
        for setting in &pack.items.settings {
            let line = format!("export {}={}", setting.key, setting.expected);
            steps.push(Step {
                item: setting.key.clone(),
                action: "set_env_var".into(),
                kind: StepKind::Run(format!(
                    "touch \"{rc}\" && if grep -q '^export {key}=' \"{rc}\"; then \
                     {sudo}sed -i 's|^export {key}=.*|{line}|' \"{rc}\"; \
                     else echo '{line}' | {sudo}tee -a \"{rc}\" >/dev/null; fi",
                    rc = rc_file,
                    key = setting.key,
                )),
            });
        }

        steps
    }

    fn resolve_template(&self, template: &str) -> std::result::Result<String, String> {
        std::fs::read_to_string(self.loader.template_path(template))
            .map_err(|e| format!("template {template}: {e}"))
    }
}

/// mkdir-p the parent, write via a uniquely-sentinelled heredoc, chmod to
/// the declared mode. The template body is inlined into the heredoc.
fn write_file_command(path: &str, mode: Option<&str>, content: &str, sudo: &str) -> String {
    let sentinel = heredoc_sentinel();
    let mut script = format!(
        "set -e\n\
         {sudo}mkdir -p \"$(dirname \"{path}\")\"\n\
         {sudo}tee \"{path}\" >/dev/null <<'{sentinel}'\n\
         {content}\n\
         {sentinel}\n"
    );
    if let Some(mode) = mode {
        script.push_str(&format!("{sudo}chmod {mode} \"{path}\"\n"));
    }
    script
}

#[cfg(test)]
mod tests {
    use super::*;

    fn access(use_sudo: bool) -> SshAccess {
        SshAccess {
            target: hlh_ssh::SshTarget {
                host: "alpha.local".into(),
                user: "homelab".into(),
            },
            private_key_pem: "KEY".into(),
            config_user: if use_sudo { "dev" } else { "homelab" }.into(),
            use_sudo,
        }
    }

    fn pack() -> ConfigPack {
        serde_yaml::from_str(
            r#"
name: base
items:
  files:
    - path: ~/.vimrc
      mode: "0644"
      template: vimrc
  packages:
    - name: htop
  settings:
    - key: EDITOR
      expected: vim
"#,
        )
        .unwrap()
    }

    async fn engine_with_templates() -> (ApplyEngine, tempfile::TempDir) {
        let store = Store::connect_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();
        std::fs::write(dir.path().join("templates/vimrc"), "set number\n").unwrap();
        let engine = ApplyEngine::new(
            store.clone(),
            Arc::new(crate::vault::Vault::new(store.clone(), "k").unwrap()),
            Arc::new(SshPool::new(
                hlh_ssh::PoolConfig::default(),
                Arc::new(crate::host_keys::DbHostKeys::new(store.clone())),
            )),
            Arc::new(PackLoader::new(dir.path())),
        );
        (engine, dir)
    }

    fn command_of(step: &Step) -> &str {
        match &step.kind {
            StepKind::Run(command) => command,
            StepKind::Fail(message) => panic!("step failed at plan time: {message}"),
        }
    }

    #[tokio::test]
    async fn steps_follow_declaration_order() {
        let (engine, _dir) = engine_with_templates().await;
        let steps = engine.build_steps(&pack(), &access(false));
        let actions: Vec<&str> = steps.iter().map(|s| s.action.as_str()).collect();
        assert_eq!(actions, vec!["write_file", "install_package", "set_env_var"]);
    }

    #[tokio::test]
    async fn file_write_uses_heredoc_and_chmod() {
        let (engine, _dir) = engine_with_templates().await;
        let steps = engine.build_steps(&pack(), &access(false));
        let command = command_of(&steps[0]);
        assert!(command.starts_with("set -e\n"));
        assert!(command.contains("mkdir -p"));
        assert!(command.contains("tee \"/home/homelab/.vimrc\""));
        assert!(command.contains("set number"));
        assert!(command.contains("chmod 0644"));
        // Sentinel opens and closes.
        assert_eq!(command.matches("HLH_EOF_").count(), 2);
    }

    #[tokio::test]
    async fn file_without_template_fails_at_plan_time() {
        let (engine, _dir) = engine_with_templates().await;
        let pack: ConfigPack = serde_yaml::from_str(
            "name: p\nitems:\n  files:\n    - path: /etc/motd\n      mode: \"0644\"\n",
        )
        .unwrap();
        let steps = engine.build_steps(&pack, &access(false));
        assert!(matches!(&steps[0].kind, StepKind::Fail(msg) if msg.contains("no template")));
    }

    #[tokio::test]
    async fn package_install_uses_apt_get() {
        let (engine, _dir) = engine_with_templates().await;
        let steps = engine.build_steps(&pack(), &access(false));
        let install = steps.iter().find(|s| s.action == "install_package").unwrap();
        assert!(command_of(install).contains("sudo -n apt-get install -y htop"));
    }

    #[tokio::test]
    async fn env_var_upserts_into_rc_file() {
        let (engine, _dir) = engine_with_templates().await;
        let steps = engine.build_steps(&pack(), &access(true));
        let setting = steps.iter().find(|s| s.action == "set_env_var").unwrap();
        let command = command_of(setting);
        assert!(command.contains("/home/dev/.bashrc"));
        assert!(command.contains("export EDITOR=vim"));
        assert!(command.contains("grep -q '^export EDITOR='"));
    }

    #[tokio::test]
    async fn start_rejects_concurrent_apply() {
        let store = Store::connect_in_memory().await.unwrap();
        {
            let mut conn = store.acquire().await.unwrap();
            servers::create(
                &mut conn,
                servers::CreateServer {
                    id: "alpha".into(),
                    guid: Some(uuid::Uuid::new_v4().to_string()),
                    hostname: "alpha.local".into(),
                    display_name: None,
                    status: hlh_domain::server::ServerStatus::Online,
                    last_seen: None,
                    machine_type: hlh_domain::server::MachineType::Server,
                },
            )
            .await
            .unwrap();
            // A pending apply already exists.
            compliance_store::insert_apply(&mut conn, "alpha", "base", 3, "user")
                .await
                .unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("base.yaml"), "name: base\n").unwrap();
        let engine = ApplyEngine::new(
            store.clone(),
            Arc::new(crate::vault::Vault::new(store.clone(), "k").unwrap()),
            Arc::new(SshPool::new(
                hlh_ssh::PoolConfig::default(),
                Arc::new(crate::host_keys::DbHostKeys::new(store.clone())),
            )),
            Arc::new(PackLoader::new(dir.path())),
        );

        let err = engine.start("alpha", "base", "user").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn preview_groups_items() {
        let store = Store::connect_in_memory().await.unwrap();
        {
            let mut conn = store.acquire().await.unwrap();
            servers::create(
                &mut conn,
                servers::CreateServer {
                    id: "alpha".into(),
                    guid: Some(uuid::Uuid::new_v4().to_string()),
                    hostname: "alpha.local".into(),
                    display_name: None,
                    status: hlh_domain::server::ServerStatus::Online,
                    last_seen: None,
                    machine_type: hlh_domain::server::MachineType::Server,
                },
            )
            .await
            .unwrap();
        }

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("base.yaml"),
            r#"
name: base
items:
  files:
    - path: /etc/motd
      mode: "0644"
  packages:
    - name: htop
    - name: curl
  settings:
    - key: EDITOR
      expected: vim
"#,
        )
        .unwrap();

        let engine = ApplyEngine::new(
            store.clone(),
            Arc::new(crate::vault::Vault::new(store.clone(), "k").unwrap()),
            Arc::new(SshPool::new(
                hlh_ssh::PoolConfig::default(),
                Arc::new(crate::host_keys::DbHostKeys::new(store.clone())),
            )),
            Arc::new(PackLoader::new(dir.path())),
        );

        let preview = engine.preview("alpha", "base").await.unwrap();
        assert_eq!(preview.total_items, 4);
        assert_eq!(preview.files.len(), 1);
        assert_eq!(preview.packages.len(), 2);
        assert_eq!(preview.settings.len(), 1);
        assert_eq!(preview.files[0].action, "write_file");

        let remove = engine.remove_preview("alpha", "base").await.unwrap();
        assert_eq!(remove.packages_skipped, vec!["htop", "curl"]);
        assert_eq!(remove.total_items, 2);
        assert!(remove.files[0]
            .description
            .as_deref()
            .unwrap()
            .contains(".homelabcmd.bak"));
    }
}
