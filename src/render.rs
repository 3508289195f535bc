//! Virtual host configuration rendering
//!
//! Rendering is plain placeholder substitution over a template and never
//! touches the filesystem, so the same entry always renders to the same bytes.

use crate::config::SubdomainEntry;
use std::path::{Path, PathBuf};

/// Built-in template: an HTTP->HTTPS redirect plus a TLS proxy block
pub const DEFAULT_TEMPLATE: &str = "\
server {
    listen 80;
    listen [::]:80;
    server_name {{SUBDOMAIN}};

    # Redirect all HTTP requests to HTTPS
    return 301 https://$host$request_uri;
}

server {
    listen 443 ssl;
    listen [::]:443 ssl;
    server_name {{SUBDOMAIN}};

    ssl_certificate {{CERT_ROOT}}/{{SUBDOMAIN}}/fullchain.pem;
    ssl_certificate_key {{CERT_ROOT}}/{{SUBDOMAIN}}/privkey.pem;
    include /etc/letsencrypt/options-ssl-nginx.conf;
    ssl_dhparam /etc/letsencrypt/ssl-dhparams.pem;

    location / {
        proxy_pass http://{{UPSTREAM}};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
{{CUSTOM_OPTIONS}}    }
}
";

/// Indentation of custom directives inside the location block
const DIRECTIVE_INDENT: &str = "        ";

/// Renders subdomain entries through a template
#[derive(Debug, Clone)]
pub struct Renderer {
    template: String,
    cert_root: PathBuf,
}

impl Renderer {
    /// Renderer over the built-in template
    pub fn new(cert_root: impl Into<PathBuf>) -> Self {
        Self {
            template: DEFAULT_TEMPLATE.to_string(),
            cert_root: cert_root.into(),
        }
    }

    /// Replace the template (builder pattern)
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = template.into();
        self
    }

    pub fn cert_root(&self) -> &Path {
        &self.cert_root
    }

    /// Render one entry
    pub fn render(&self, entry: &SubdomainEntry) -> String {
        let upstream = &entry.upstream;
        let cert_root = self.cert_root.display().to_string();
        let cert_root = cert_root.trim_end_matches('/');

        let custom_options: String = upstream
            .custom_directives
            .iter()
            .map(|directive| format!("{}{}\n", DIRECTIVE_INDENT, directive))
            .collect();

        substitute(&self.template, |key| match key {
            "SUBDOMAIN" => Some(entry.name.clone()),
            "TARGET_IP" => Some(upstream.address.to_string()),
            "TARGET_PORT" => Some(upstream.port.to_string()),
            "UPSTREAM" => Some(upstream.socket_addr().to_string()),
            "CERT_ROOT" => Some(cert_root.to_string()),
            "CUSTOM_OPTIONS" => Some(custom_options.clone()),
            _ => None,
        })
    }
}

/// Replace every `{{KEY}}` the lookup knows in one left-to-right pass
///
/// Substituted text is not scanned again and unknown placeholders are kept as-is.
fn substitute<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len() + 256);
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        match after.find("}}") {
            Some(end) => {
                let key = &after[..end];
                match lookup(key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str("{{");
                        out.push_str(key);
                        out.push_str("}}");
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Upstream;

    fn entry(port: u16, directives: &[&str]) -> SubdomainEntry {
        SubdomainEntry::new(
            "app.example.com",
            Upstream::new("192.168.0.215".parse().unwrap(), port)
                .with_directives(directives.iter().map(|d| d.to_string()).collect()),
        )
    }

    #[test]
    fn test_render_is_deterministic() {
        let renderer = Renderer::new("/etc/letsencrypt/live");
        let e = entry(8080, &["client_max_body_size 50m;"]);
        assert_eq!(renderer.render(&e), renderer.render(&e));
    }

    #[test]
    fn test_render_contains_both_server_blocks() {
        let renderer = Renderer::new("/etc/letsencrypt/live");
        let out = renderer.render(&entry(8080, &[]));

        assert!(out.contains("listen 80;"));
        assert!(out.contains("return 301 https://$host$request_uri;"));
        assert!(out.contains("listen 443 ssl;"));
        assert!(out.contains("listen [::]:443 ssl;"));
        assert!(out.contains("server_name app.example.com;"));
        assert!(out.contains("ssl_certificate /etc/letsencrypt/live/app.example.com/fullchain.pem;"));
        assert!(out.contains("ssl_certificate_key /etc/letsencrypt/live/app.example.com/privkey.pem;"));
        assert!(out.contains("proxy_pass http://192.168.0.215:8080;"));
        assert!(out.contains("proxy_set_header Host $host;"));
        assert!(out.contains("proxy_set_header X-Real-IP $remote_addr;"));
        assert!(out.contains("proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"));
        assert!(out.contains("proxy_set_header X-Forwarded-Proto $scheme;"));
        assert!(!out.contains("{{"));
    }

    #[test]
    fn test_port_change_only_touches_proxy_pass() {
        let renderer = Renderer::new("/etc/letsencrypt/live");
        let a = renderer.render(&entry(8080, &["proxy_read_timeout 300;"]));
        let b = renderer.render(&entry(9090, &["proxy_read_timeout 300;"]));

        let diff: Vec<(&str, &str)> = a.lines().zip(b.lines()).filter(|(x, y)| x != y).collect();
        assert_eq!(a.lines().count(), b.lines().count());
        assert_eq!(
            diff,
            vec![(
                "        proxy_pass http://192.168.0.215:8080;",
                "        proxy_pass http://192.168.0.215:9090;"
            )]
        );
    }

    #[test]
    fn test_custom_directives_keep_order_inside_location() {
        let renderer = Renderer::new("/etc/letsencrypt/live");
        let out = renderer.render(&entry(
            8080,
            &["client_max_body_size 50m;", "proxy_read_timeout 300;", "proxy_buffering off;"],
        ));

        let location = out.find("location / {").unwrap();
        let first = out.find("        client_max_body_size 50m;\n").unwrap();
        let second = out.find("        proxy_read_timeout 300;\n").unwrap();
        let third = out.find("        proxy_buffering off;\n").unwrap();
        let closing = out[third..].find("    }").unwrap() + third;

        assert!(location < first && first < second && second < third && third < closing);
    }

    #[test]
    fn test_no_directives_leaves_no_blank_line() {
        let renderer = Renderer::new("/etc/letsencrypt/live");
        let out = renderer.render(&entry(8080, &[]));
        assert!(out.contains("X-Forwarded-Proto $scheme;\n    }\n}"));
    }

    #[test]
    fn test_ipv6_upstream_is_bracketed() {
        let renderer = Renderer::new("/etc/letsencrypt/live");
        let e = SubdomainEntry::new("v6.example.com", Upstream::new("fd00::5".parse().unwrap(), 3000));
        assert!(renderer.render(&e).contains("proxy_pass http://[fd00::5]:3000;"));
    }

    #[test]
    fn test_cert_root_trailing_slash() {
        let renderer = Renderer::new("/srv/certs/");
        let out = renderer.render(&entry(8080, &[]));
        assert!(out.contains("ssl_certificate /srv/certs/app.example.com/fullchain.pem;"));
    }

    #[test]
    fn test_custom_template() {
        let renderer = Renderer::new("/certs")
            .with_template("{{SUBDOMAIN}} -> {{TARGET_IP}}:{{TARGET_PORT}} {{UNKNOWN}}\n{{CUSTOM_OPTIONS}}");
        let out = renderer.render(&entry(8080, &["gzip on;"]));
        assert_eq!(out, "app.example.com -> 192.168.0.215:8080 {{UNKNOWN}}\n        gzip on;\n");
    }

    #[test]
    fn test_substituted_text_is_not_rescanned() {
        let renderer = Renderer::new("/certs").with_template("{{CUSTOM_OPTIONS}}");
        let out = renderer.render(&entry(8080, &["add_header X-Host {{SUBDOMAIN}};"]));
        assert_eq!(out, "        add_header X-Host {{SUBDOMAIN}};\n");
    }

    #[test]
    fn test_unterminated_placeholder_is_kept() {
        assert_eq!(substitute("a {{OPEN", |_| Some("x".to_string())), "a {{OPEN");
        assert_eq!(substitute("{{A}}{{B}}", |k| Some(k.to_lowercase())), "ab");
    }
}
