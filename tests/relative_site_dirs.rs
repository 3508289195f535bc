//! Site directories configured as relative paths
//!
//! Lives in its own test binary because it changes the working directory.

use domain_manager::config::{SubdomainEntry, Upstream};
use domain_manager::render::Renderer;
use domain_manager::repository::ProxyConfigRepository;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_relative_directories_produce_resolvable_links() {
    let tmp = TempDir::new().unwrap();
    std::env::set_current_dir(tmp.path()).unwrap();

    let repo = ProxyConfigRepository::new(
        "sites-available",
        "sites-enabled",
        "backup",
        Renderer::new("live"),
    );
    let entry = SubdomainEntry::new(
        "api.example.com",
        Upstream::new("10.0.0.5".parse().unwrap(), 3000),
    );

    let pair = repo.materialize(&entry).unwrap();
    let content = fs::read_to_string(&pair.available).unwrap();
    assert_eq!(fs::read_to_string(&pair.enabled).unwrap(), content);

    #[cfg(unix)]
    {
        let target = fs::read_link(&pair.enabled).unwrap();
        assert!(target.is_absolute());

        // Re-materializing recognises the existing link
        repo.materialize(&entry).unwrap();
        assert_eq!(fs::read_link(&pair.enabled).unwrap(), target);
    }

    assert_eq!(repo.list_managed().unwrap(), vec!["api.example.com"]);

    repo.remove("api.example.com").unwrap();
    assert!(fs::symlink_metadata(&pair.enabled).is_err());
    assert!(!pair.available.exists());
}
