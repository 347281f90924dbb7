//! Serving engine configuration rendering
//!
//! Produces a complete nginx/OpenResty configuration from a route snapshot.
//! Output depends only on the snapshot's entries and the render options:
//! hostnames are emitted in sorted order and the generation number is not part
//! of the text, so logically identical tables render byte-identical files.

use crate::config::Config;
use crate::routes::{RouteEntry, RouteSnapshot};
use std::fmt::{self, Write};
use std::path::PathBuf;

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Clone, PartialEq)]
pub struct RenderOptions {
    pub http_port: u16,
    /// 0 disables the TLS listener
    pub https_port: u16,
    /// Local admin API port, used for ACME HTTP-01 challenges
    pub admin_port: u16,
    /// Certificate presented before the engine asks for a per-host certificate
    pub default_certificate: Option<(PathBuf, PathBuf)>,
    /// Extra directive inserted into TLS server blocks, e.g. an
    /// `ssl_certificate_by_lua_block` that queries the admin API
    pub certificate_hook: Option<String>,
}

impl RenderOptions {
    pub fn from_config(config: &Config, default_certificate: Option<(PathBuf, PathBuf)>) -> Self {
        Self {
            http_port: config.server.http_port,
            https_port: config.server.https_port,
            admin_port: config.server.admin_port,
            default_certificate,
            certificate_hook: config.engine.certificate_hook.clone(),
        }
    }

    fn tls_enabled(&self) -> bool {
        self.https_port > 0 && self.default_certificate.is_some()
    }
}

/// Render the engine configuration for a snapshot
pub fn render(snapshot: &RouteSnapshot, options: &RenderOptions) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail
    let _ = write_config(&mut out, snapshot, options);
    out
}

fn write_config(out: &mut String, snapshot: &RouteSnapshot, options: &RenderOptions) -> fmt::Result {
    writeln!(out, "# Generated by dockgate. Manual changes are overwritten.")?;
    writeln!(out, "worker_processes auto;")?;
    writeln!(out)?;
    writeln!(out, "events {{")?;
    writeln!(out, "    worker_connections 1024;")?;
    writeln!(out, "}}")?;
    writeln!(out)?;
    writeln!(out, "http {{")?;
    writeln!(out, "    server_tokens off;")?;
    writeln!(out, "    map $http_upgrade $connection_upgrade {{")?;
    writeln!(out, "        default upgrade;")?;
    writeln!(out, "        ''      close;")?;
    writeln!(out, "    }}")?;

    for (index, entry) in snapshot.entries().enumerate() {
        writeln!(out)?;
        write_upstream(out, index, entry)?;
        writeln!(out)?;
        write_server(out, index, entry, options)?;
    }

    writeln!(out)?;
    write_default_server(out, options)?;
    writeln!(out, "}}")?;
    Ok(())
}

fn upstream_name(index: usize, hostname: &str) -> String {
    let sanitized: String = hostname
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("dockgate_{}_{}", index, sanitized)
}

fn write_upstream(out: &mut String, index: usize, entry: &RouteEntry) -> fmt::Result {
    writeln!(out, "    upstream {} {{", upstream_name(index, &entry.hostname))?;
    writeln!(out, "        server {};", entry.upstream)?;
    writeln!(out, "    }}")
}

fn write_listeners(out: &mut String, options: &RenderOptions, default_server: bool) -> fmt::Result {
    let suffix = if default_server { " default_server" } else { "" };
    writeln!(out, "        listen {}{};", options.http_port, suffix)?;
    if options.tls_enabled() {
        writeln!(out, "        listen {} ssl{};", options.https_port, suffix)?;
        if let Some((cert, key)) = &options.default_certificate {
            writeln!(out, "        ssl_certificate {};", cert.display())?;
            writeln!(out, "        ssl_certificate_key {};", key.display())?;
        }
        if let Some(hook) = &options.certificate_hook {
            for line in hook.lines() {
                writeln!(out, "        {}", line)?;
            }
        }
    }
    Ok(())
}

fn write_challenge_location(out: &mut String, options: &RenderOptions) -> fmt::Result {
    writeln!(out, "        location {} {{", ACME_CHALLENGE_PREFIX)?;
    writeln!(out, "            proxy_pass http://127.0.0.1:{};", options.admin_port)?;
    writeln!(out, "        }}")
}

fn write_server(out: &mut String, index: usize, entry: &RouteEntry, options: &RenderOptions) -> fmt::Result {
    writeln!(out, "    server {{")?;
    write_listeners(out, options, false)?;
    writeln!(out, "        server_name {};", entry.hostname)?;
    writeln!(out)?;
    write_challenge_location(out, options)?;
    writeln!(out)?;
    writeln!(out, "        location / {{")?;
    writeln!(out, "            proxy_pass http://{};", upstream_name(index, &entry.hostname))?;
    writeln!(out, "            proxy_http_version 1.1;")?;
    writeln!(out, "            proxy_set_header Host $host;")?;
    writeln!(out, "            proxy_set_header X-Real-IP $remote_addr;")?;
    writeln!(out, "            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;")?;
    writeln!(out, "            proxy_set_header X-Forwarded-Proto $scheme;")?;
    writeln!(out, "            proxy_set_header Upgrade $http_upgrade;")?;
    writeln!(out, "            proxy_set_header Connection $connection_upgrade;")?;
    writeln!(out, "        }}")?;
    writeln!(out, "    }}")
}

/// Catch-all server answering 404 for hosts without a route
fn write_default_server(out: &mut String, options: &RenderOptions) -> fmt::Result {
    writeln!(out, "    server {{")?;
    write_listeners(out, options, true)?;
    writeln!(out, "        server_name _;")?;
    writeln!(out)?;
    write_challenge_location(out, options)?;
    writeln!(out)?;
    writeln!(out, "        location / {{")?;
    writeln!(out, "            return 404;")?;
    writeln!(out, "        }}")?;
    writeln!(out, "    }}")
}
