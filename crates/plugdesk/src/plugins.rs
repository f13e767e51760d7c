// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `plugdesk plugins` subcommands. These never load a guest.

use std::path::Path;

use plugdesk_config::PlugdeskConfig;
use plugdesk_core::PlugdeskError;
use plugdesk_plugin::{install_upload, PackagedPlugin};

use crate::serve::build_manager;

/// Print every plugin package found in the plugin directory.
pub fn list(config: &PlugdeskConfig) -> Result<(), PlugdeskError> {
    let manager = build_manager(config)?;
    manager.discover()?;
    let plugins = manager.status();
    if plugins.is_empty() {
        println!("no plugins in {}", manager.plugin_dir().display());
        return Ok(());
    }
    println!("{:<24} {:<8} PATH", "NAME", "RUNTIME");
    for plugin in plugins {
        println!(
            "{:<24} {:<8} {}",
            plugin.name,
            plugin.runtime.to_string(),
            plugin.path.display()
        );
    }
    Ok(())
}

/// Install a package into the plugin directory.
///
/// A running server with hot reload enabled picks it up on its own.
pub fn install(config: &PlugdeskConfig, file: &Path) -> Result<(), PlugdeskError> {
    let packaged = install_file(Path::new(&config.plugins.dir), file)?;
    println!(
        "installed {} ({}) at {}",
        packaged.name,
        packaged.runtime,
        packaged.binary_path.display()
    );
    Ok(())
}

fn install_file(plugin_dir: &Path, file: &Path) -> Result<PackagedPlugin, PlugdeskError> {
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PlugdeskError::Validation(format!("{} is not a file", file.display())))?;
    let bytes = std::fs::read(file)?;
    install_upload(plugin_dir, filename, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use plugdesk_test_utils::archive::{tar_gz_bytes, WASM_STUB};

    #[test]
    fn installs_a_tarball_into_the_plugin_dir() {
        let staging = tempfile::tempdir().unwrap();
        let plugins = tempfile::tempdir().unwrap();
        let package = staging.path().join("notify.tar.gz");
        std::fs::write(
            &package,
            tar_gz_bytes(&[
                (
                    "plugin.toml",
                    b"[plugin]\nname = \"notify\"\nversion = \"0.1.0\"\nwasm = \"notify.wasm\"\n",
                ),
                ("notify.wasm", WASM_STUB),
            ]),
        )
        .unwrap();

        let packaged = install_file(plugins.path(), &package).unwrap();
        assert_eq!(packaged.name, "notify");
        assert!(packaged.binary_path.starts_with(plugins.path()));
        assert!(packaged.binary_path.exists());
    }

    #[test]
    fn missing_package_is_an_io_error() {
        let plugins = tempfile::tempdir().unwrap();
        let err = install_file(plugins.path(), Path::new("/nonexistent/ghost.wasm")).unwrap_err();
        assert!(matches!(err, PlugdeskError::Io(_)));
    }
}
