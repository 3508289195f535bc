//! Domain Manager - nginx virtual hosts and TLS certificates for internal services
//!
//! This library keeps a small desired state (subdomain -> upstream address and
//! port) and reconciles it against the proxy's configuration directories:
//! - Renders one virtual host per subdomain with an HTTP->HTTPS redirect
//! - Activates configs through links in the enabled directory
//! - Obtains, renews and deletes certificates through certbot
//! - Reloads nginx only after its configuration check passes
//! - Backs up every file before it is overwritten or deleted

pub mod certs;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod logging;
pub mod process;
pub mod render;
pub mod repository;
pub mod validate;
