//! Configuration document renderer.
//!
//! Turns a [`RenderContext`] into the concrete documents the rest of the
//! system consumes: mock build-root configs, cloud-init seed files, the guest
//! preparation script and yum repository files. Rendering is a pure
//! transformation; nothing here touches the filesystem.
//!
//! User-supplied templates use `{{ var }}` placeholders. Unknown variables
//! and unterminated placeholders are configuration errors, never left in the
//! output verbatim.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::config::{ProjectConfig, RepoConfig};
use crate::domain::{Arch, Classify, ErrorClass};
use crate::vm::{FsTransport, SharedMount};

/// Errors produced while rendering.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("unknown template variable `{name}` at offset {offset}")]
    UnknownVariable { name: String, offset: usize },

    #[error("unterminated placeholder at offset {0}")]
    Unterminated(usize),

    #[error("empty placeholder at offset {0}")]
    EmptyPlaceholder(usize),
}

impl Classify for RenderError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Configuration
    }
}

/// Result type for rendering.
pub type RenderResult<T> = std::result::Result<T, RenderError>;

/// Proxy settings handed to build roots and guests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub proxy: Option<String>,
    pub no_proxy: Option<String>,
}

/// Everything a document needs, with architecture as an explicit field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenderContext {
    /// Build-root or guest name.
    pub name: String,
    pub arch: Arch,
    pub repos: Vec<RepoConfig>,
    pub proxy: ProxyConfig,
}

impl RenderContext {
    /// Context for `arch` drawn from a project config.
    pub fn for_project(config: &ProjectConfig, name: impl Into<String>, arch: &Arch) -> Self {
        Self {
            name: name.into(),
            arch: arch.clone(),
            repos: config.repos_for(arch),
            proxy: ProxyConfig {
                proxy: config.proxy.clone(),
                no_proxy: config.no_proxy.clone(),
            },
        }
    }

    /// Add a repository ahead of the configured ones.
    pub fn with_repo(mut self, repo: RepoConfig) -> Self {
        self.repos.insert(0, repo);
        self
    }

    /// Scalar variables available to `{{ var }}` templates.
    pub fn variables(&self) -> BTreeMap<&'static str, String> {
        let mut vars = BTreeMap::new();
        vars.insert("name", self.name.clone());
        vars.insert("arch", self.arch.to_string());
        vars.insert("proxy", self.proxy.proxy.clone().unwrap_or_default());
        vars.insert("no_proxy", self.proxy.no_proxy.clone().unwrap_or_default());
        vars.insert(
            "repos",
            self.repos
                .iter()
                .map(|r| r.name.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );
        vars
    }
}

/// Substitute `{{ var }}` placeholders in `template`.
pub fn render_template(template: &str, vars: &BTreeMap<&str, String>) -> RenderResult<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or(RenderError::Unterminated(offset + start))?;
        let name = after[..end].trim();
        if name.is_empty() {
            return Err(RenderError::EmptyPlaceholder(offset + start));
        }
        let value = vars.get(name).ok_or_else(|| RenderError::UnknownVariable {
            name: name.to_string(),
            offset: offset + start,
        })?;
        out.push_str(value);

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Render a user template against a context.
pub fn render_with(template: &str, ctx: &RenderContext) -> RenderResult<String> {
    render_template(template, &ctx.variables())
}

fn push_repo_section(out: &mut String, repo: &RepoConfig, baseurl: &str) {
    let _ = writeln!(out, "[{}]", repo.name);
    let _ = writeln!(out, "name={}", repo.name);
    let _ = writeln!(out, "baseurl={baseurl}");
    let _ = writeln!(out, "gpgcheck=0");
    let _ = writeln!(out, "priority={}", repo.priority);
    if repo.module_hotfixes {
        let _ = writeln!(out, "module_hotfixes=true");
    }
    if !repo.excludepkgs.is_empty() {
        let _ = writeln!(out, "excludepkgs={}", repo.excludepkgs.join(","));
    }
    if let Some(proxy) = &repo.proxy {
        let _ = writeln!(out, "proxy={proxy}");
    }
}

/// Mock build-root configuration.
///
/// Repositories use their `$basearch` form so dnf inside the root resolves
/// the target architecture itself.
pub fn mock_config(ctx: &RenderContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "config_opts['root'] = '{}'", ctx.name);
    let _ = writeln!(out, "config_opts['target_arch'] = '{}'", ctx.arch);
    let _ = writeln!(out, "config_opts['legal_host_arches'] = ('{}',)", ctx.arch);
    let _ = writeln!(out, "config_opts['chroot_setup_cmd'] = 'install @buildsys-build'");
    let _ = writeln!(out, "config_opts['package_manager'] = 'dnf'");
    if let Some(proxy) = &ctx.proxy.proxy {
        let _ = writeln!(out, "config_opts['http_proxy'] = '{proxy}'");
    }
    if let Some(no_proxy) = &ctx.proxy.no_proxy {
        let _ = writeln!(out, "config_opts['no_proxy'] = '{no_proxy}'");
    }
    out.push_str("config_opts['dnf.conf'] = \"\"\"\n");
    out.push_str("[main]\nkeepcache=1\ndebuglevel=2\nreposdir=/dev/null\n");
    out.push_str("retries=20\nobsoletes=1\ngpgcheck=0\nassumeyes=1\n");
    out.push_str("syslog_ident=mock\nsyslog_device=\nmodule_platform_id=\n");
    if let Some(proxy) = &ctx.proxy.proxy {
        let _ = writeln!(out, "proxy={proxy}");
    }
    for repo in &ctx.repos {
        out.push('\n');
        push_repo_section(&mut out, repo, &repo.generic_url);
    }
    out.push_str("\"\"\"\n");
    out
}

/// Yum repository file listing every repository.
///
/// Local repositories point at their guest mount point, so the file is only
/// meaningful inside a guest prepared with [`prepare_script`].
pub fn yum_repo_file(repos: &[RepoConfig]) -> String {
    let mut out = String::new();
    for (i, repo) in repos.iter().enumerate() {
        if i > 0 {
            out.push('\n');
        }
        let baseurl = if repo.is_local() {
            format!("file://{}/", guest_mount_point(&repo.name))
        } else {
            repo.url.clone()
        };
        push_repo_section(&mut out, repo, &baseurl);
    }
    out
}

/// Where the share for repository `name` is mounted in the guest.
pub fn guest_mount_point(name: &str) -> String {
    format!("/rpmgate.{name}")
}

/// Mount options for a transport, as written to fstab.
pub fn mount_options(transport: FsTransport) -> &'static str {
    match transport {
        FsTransport::NineP => "trans=virtio,version=9p2000.L,msize=131096",
        FsTransport::VirtioFs => "defaults",
    }
}

/// Shell script run once in a freshly booted guest.
///
/// Adds a host entry, records fstab entries for each share, replaces the
/// guest's yum repositories with one `rpmgate.repo` and refreshes the cache.
pub fn prepare_script(ctx: &RenderContext, address: &str, mounts: &[SharedMount]) -> String {
    let mut out = String::from("set -e\n");
    let _ = writeln!(out, "echo '{address} {}' >> /etc/hosts", ctx.name);
    if let Some(proxy) = &ctx.proxy.proxy {
        let _ = writeln!(out, "echo 'proxy={proxy}' >> /etc/dnf/dnf.conf");
    }
    for mount in mounts {
        let ro = if mount.read_only { ",ro" } else { "" };
        let _ = writeln!(
            out,
            "grep -q ' {guest} ' /etc/fstab || echo '{tag} {guest} {fs} {opts}{ro} 0 0' >> /etc/fstab",
            guest = mount.guest_path,
            tag = mount.tag,
            fs = mount.transport.fs_type(),
            opts = mount_options(mount.transport),
        );
    }
    out.push_str("rm -f /etc/yum.repos.d/*.repo\n");
    out.push_str("cat > /etc/yum.repos.d/rpmgate.repo <<'RPMGATE_EOF'\n");
    out.push_str(&yum_repo_file(&ctx.repos));
    out.push_str("RPMGATE_EOF\n");
    out.push_str("if [ -x /usr/bin/dnf ]; then dnf -d1 makecache; else yum -d1 makecache fast; fi\n");
    out
}

/// cloud-init `user-data` for the nocloud seed.
///
/// The final message doubles as the console ready marker.
pub fn cloud_init_user_data(ctx: &RenderContext, ssh_pubkey: Option<&str>, ready_marker: &str) -> String {
    let mut out = String::from("#cloud-config\n");
    let _ = writeln!(out, "hostname: {}", ctx.name);
    out.push_str("disable_root: false\n");
    if let Some(key) = ssh_pubkey {
        out.push_str("users:\n  - name: root\n    ssh_authorized_keys:\n");
        let _ = writeln!(out, "      - {key}");
    }
    if ctx.proxy.proxy.is_some() || ctx.proxy.no_proxy.is_some() {
        out.push_str("write_files:\n  - path: /etc/environment\n    append: true\n    content: |\n");
        if let Some(proxy) = &ctx.proxy.proxy {
            let _ = writeln!(out, "      http_proxy={proxy}\n      https_proxy={proxy}");
        }
        if let Some(no_proxy) = &ctx.proxy.no_proxy {
            let _ = writeln!(out, "      no_proxy={no_proxy}");
        }
    }
    let _ = writeln!(out, "final_message: \"{ready_marker}\"");
    out
}

/// cloud-init `meta-data` for the nocloud seed.
pub fn cloud_init_meta_data(ctx: &RenderContext, instance_id: &str) -> String {
    format!("instance-id: {instance_id}\nlocal-hostname: {}\n", ctx.name)
}
