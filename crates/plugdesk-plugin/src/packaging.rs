// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Upload validation and package extraction.
//!
//! Uploads are either a bare `.wasm` module or an archive (`.zip`, `.tar.gz`,
//! `.tgz`) holding a module and a `plugin.toml`. Archives are unpacked into a
//! staging directory inside the plugin directory and only renamed into place
//! once the bundle is known to be valid, so a rejected upload never touches
//! the live tree.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use plugdesk_core::{is_valid_plugin_name, PlugdeskError, PluginSource, RuntimeKind};
use serde::Serialize;
use tracing::{debug, info};

use crate::manifest::{parse_package_descriptor, PackageDescriptor};

/// Descriptor file name inside a bundle.
pub const PACKAGE_DESCRIPTOR: &str = "plugin.toml";

const WASM_MAGIC: &[u8] = b"\0asm";
const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = b"\x1f\x8b";

/// Upper bound on the total size of an extracted archive.
const MAX_EXTRACTED_BYTES: u64 = 512 * 1024 * 1024;
const MAX_ARCHIVE_ENTRIES: usize = 10_000;

/// A plugin written to the plugin directory, ready to register.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackagedPlugin {
    pub name: String,
    pub binary_path: PathBuf,
    pub runtime: RuntimeKind,
    /// Directory the module runs from.
    pub root: PathBuf,
}

impl PackagedPlugin {
    pub fn source(&self) -> PluginSource {
        PluginSource {
            name: self.name.clone(),
            runtime: self.runtime,
            binary_path: self.binary_path.clone(),
            root: self.root.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadKind {
    Wasm,
    Zip,
    TarGz,
}

fn invalid(message: impl Into<String>) -> PlugdeskError {
    PlugdeskError::Validation(message.into())
}

/// Classify an upload by extension and signature. Returns the kind and the
/// file stem with the extension removed.
fn classify<'a>(filename: &'a str, bytes: &[u8]) -> Result<(UploadKind, &'a str), PlugdeskError> {
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| invalid("upload has no file name"))?;
    let lower = base.to_ascii_lowercase();

    let (kind, ext_len, magic) = if lower.ends_with(".wasm") {
        (UploadKind::Wasm, ".wasm".len(), WASM_MAGIC)
    } else if lower.ends_with(".zip") {
        (UploadKind::Zip, ".zip".len(), ZIP_MAGIC)
    } else if lower.ends_with(".tar.gz") {
        (UploadKind::TarGz, ".tar.gz".len(), GZIP_MAGIC)
    } else if lower.ends_with(".tgz") {
        (UploadKind::TarGz, ".tgz".len(), GZIP_MAGIC)
    } else {
        return Err(invalid(format!(
            "unsupported file type `{base}`; expected .wasm, .zip, .tar.gz or .tgz"
        )));
    };

    if !bytes.starts_with(magic) {
        return Err(invalid(format!(
            "`{base}` does not look like a {} file",
            &lower[lower.len() - ext_len + 1..]
        )));
    }
    Ok((kind, &base[..base.len() - ext_len]))
}

/// Validate an upload and install it under `plugin_dir`.
///
/// Blocking; call from `spawn_blocking` in async contexts.
pub fn install_upload(
    plugin_dir: &Path,
    filename: &str,
    bytes: &[u8],
) -> Result<PackagedPlugin, PlugdeskError> {
    let (kind, stem) = classify(filename, bytes)?;
    std::fs::create_dir_all(plugin_dir)?;

    let packaged = match kind {
        UploadKind::Wasm => install_module(plugin_dir, stem, bytes)?,
        UploadKind::Zip => install_archive(plugin_dir, bytes, extract_zip)?,
        UploadKind::TarGz => install_archive(plugin_dir, bytes, extract_tar_gz)?,
    };
    info!(
        plugin = %packaged.name,
        runtime = %packaged.runtime,
        path = %packaged.binary_path.display(),
        "plugin package installed"
    );
    Ok(packaged)
}

fn install_module(plugin_dir: &Path, stem: &str, bytes: &[u8]) -> Result<PackagedPlugin, PlugdeskError> {
    if !is_valid_plugin_name(stem) {
        return Err(invalid(format!(
            "`{stem}` is not a valid plugin name; use letters, digits, `-` and `_`"
        )));
    }

    let mut tmp = tempfile::Builder::new()
        .prefix(".upload-")
        .suffix(".tmp")
        .tempfile_in(plugin_dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;

    let target = plugin_dir.join(format!("{stem}.wasm"));
    tmp.persist(&target).map_err(|e| PlugdeskError::Io(e.error))?;

    // A bundle under the same name would shadow the new module.
    replace_dir(plugin_dir, stem, None)?;

    Ok(PackagedPlugin {
        name: stem.to_string(),
        binary_path: target,
        runtime: RuntimeKind::Wasm,
        root: plugin_dir.to_path_buf(),
    })
}

fn install_archive(
    plugin_dir: &Path,
    bytes: &[u8],
    extract: fn(&[u8], &Path) -> Result<(), PlugdeskError>,
) -> Result<PackagedPlugin, PlugdeskError> {
    let staging = tempfile::Builder::new()
        .prefix(".staging-")
        .tempdir_in(plugin_dir)?;
    let extracted = staging.path().join("bundle");
    std::fs::create_dir_all(&extracted)?;

    extract(bytes, &extracted)?;

    let bundle_root = locate_bundle_root(&extracted)?;
    let staged = source_from_bundle(&bundle_root)?;
    let relative = staged
        .binary_path
        .strip_prefix(&bundle_root)
        .map_err(|_| invalid("module path escapes the bundle"))?
        .to_path_buf();

    let target = plugin_dir.join(&staged.name);
    replace_dir(plugin_dir, &staged.name, Some(&bundle_root))?;

    // A bare module under the same name would shadow the new bundle.
    let bare = plugin_dir.join(format!("{}.wasm", staged.name));
    if bare.is_file() {
        std::fs::remove_file(&bare)?;
    }

    debug!(plugin = %staged.name, dir = %target.display(), "bundle moved into place");
    Ok(PackagedPlugin {
        name: staged.name,
        binary_path: target.join(relative),
        runtime: staged.runtime,
        root: target,
    })
}

/// Move `<plugin_dir>/<name>` aside, put `replacement` in its place, then
/// delete the old copy. With `replacement = None` the directory is removed.
fn replace_dir(plugin_dir: &Path, name: &str, replacement: Option<&Path>) -> Result<(), PlugdeskError> {
    let target = plugin_dir.join(name);
    let aside = tempfile::Builder::new()
        .prefix(".replaced-")
        .tempdir_in(plugin_dir)?;
    let parked = aside.path().join(name);
    let had_previous = target.is_dir();
    if had_previous {
        std::fs::rename(&target, &parked)?;
    }

    if let Some(replacement) = replacement
        && let Err(e) = std::fs::rename(replacement, &target)
    {
        if had_previous {
            std::fs::rename(&parked, &target)?;
        }
        return Err(e.into());
    }
    // Dropping `aside` deletes the previous version.
    Ok(())
}

fn locate_bundle_root(extracted: &Path) -> Result<PathBuf, PlugdeskError> {
    if extracted.join(PACKAGE_DESCRIPTOR).is_file() {
        return Ok(extracted.to_path_buf());
    }
    // Archives commonly wrap everything in one top-level directory.
    let entries: Vec<PathBuf> = std::fs::read_dir(extracted)?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .collect();
    if let [only] = entries.as_slice()
        && only.is_dir()
        && only.join(PACKAGE_DESCRIPTOR).is_file()
    {
        return Ok(only.clone());
    }
    Err(invalid(format!("archive does not contain {PACKAGE_DESCRIPTOR}")))
}

/// Build a [`PluginSource`] for a bundle directory holding a `plugin.toml`.
pub fn source_from_bundle(dir: &Path) -> Result<PluginSource, PlugdeskError> {
    let raw = std::fs::read_to_string(dir.join(PACKAGE_DESCRIPTOR))?;
    let descriptor = parse_package_descriptor(&raw)?;
    let (runtime, module) = resolve_module(dir, &descriptor)?;
    Ok(PluginSource {
        name: descriptor.name,
        runtime,
        binary_path: dir.join(module),
        root: dir.to_path_buf(),
    })
}

/// Decide the runtime and module path for a bundle and check the module exists.
fn resolve_module(
    dir: &Path,
    descriptor: &PackageDescriptor,
) -> Result<(RuntimeKind, PathBuf), PlugdeskError> {
    let wasm_candidate = || -> Option<PathBuf> {
        if let Some(wasm) = &descriptor.wasm {
            return Some(PathBuf::from(wasm));
        }
        if let Some(binary) = &descriptor.binary
            && binary.ends_with(".wasm")
        {
            return Some(PathBuf::from(binary));
        }
        let named = PathBuf::from(format!("{}.wasm", descriptor.name));
        if dir.join(&named).is_file() {
            return Some(named);
        }
        let modules: Vec<PathBuf> = std::fs::read_dir(dir)
            .ok()?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "wasm"))
            .collect();
        match modules.as_slice() {
            [only] => only.file_name().map(PathBuf::from),
            _ => None,
        }
    };

    let (runtime, module) = match descriptor.runtime {
        Some(RuntimeKind::Wasm) => (
            RuntimeKind::Wasm,
            wasm_candidate().ok_or_else(|| invalid("wasm bundle has no module"))?,
        ),
        Some(RuntimeKind::Process) => (
            RuntimeKind::Process,
            descriptor
                .binary
                .as_ref()
                .map(PathBuf::from)
                .ok_or_else(|| invalid("process bundle must set `binary` in plugin.toml"))?,
        ),
        None => match (wasm_candidate(), &descriptor.binary) {
            (Some(module), _) => (RuntimeKind::Wasm, module),
            (None, Some(binary)) => (RuntimeKind::Process, PathBuf::from(binary)),
            (None, None) => {
                return Err(invalid(
                    "cannot determine runtime: bundle has no .wasm module and no `binary`",
                ));
            }
        },
    };

    let full = dir.join(&module);
    if !full.is_file() {
        return Err(invalid(format!(
            "module `{}` listed in {PACKAGE_DESCRIPTOR} does not exist",
            module.display()
        )));
    }
    match runtime {
        RuntimeKind::Wasm => {
            let mut head = [0u8; 4];
            let mut file = std::fs::File::open(&full)?;
            if file.read_exact(&mut head).is_err() || head != WASM_MAGIC {
                return Err(invalid(format!(
                    "`{}` is not a WebAssembly module",
                    module.display()
                )));
            }
        }
        RuntimeKind::Process => make_executable(&full)?,
    }
    Ok((runtime, module))
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<(), PlugdeskError> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    if perms.mode() & 0o111 == 0 {
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<(), PlugdeskError> {
    Ok(())
}

/// Reject absolute paths and `..` components.
fn checked_relative(raw: &str) -> Result<PathBuf, PlugdeskError> {
    let path = Path::new(raw);
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
    {
        return Err(invalid(format!("unsafe path in archive: {raw}")));
    }
    Ok(path.to_path_buf())
}

/// Tracks the total bytes written during extraction.
struct Budget {
    remaining: u64,
    entries: usize,
}

impl Budget {
    fn new() -> Self {
        Self {
            remaining: MAX_EXTRACTED_BYTES,
            entries: 0,
        }
    }

    fn next_entry(&mut self) -> Result<(), PlugdeskError> {
        self.entries += 1;
        if self.entries > MAX_ARCHIVE_ENTRIES {
            return Err(invalid("archive has too many entries"));
        }
        Ok(())
    }

    fn copy(&mut self, reader: impl Read, out: &Path) -> Result<(), PlugdeskError> {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::File::create(out)?;
        let written = std::io::copy(&mut reader.take(self.remaining + 1), &mut file)?;
        if written > self.remaining {
            return Err(invalid("archive expands beyond the size limit"));
        }
        self.remaining -= written;
        Ok(())
    }
}

fn extract_zip(bytes: &[u8], out_dir: &Path) -> Result<(), PlugdeskError> {
    let archive = rawzip::ZipArchive::from_slice(bytes)
        .map_err(|e| invalid(format!("invalid zip archive: {e:?}")))?;
    let mut budget = Budget::new();

    for entry in archive.entries() {
        let entry = entry.map_err(|e| invalid(format!("zip entry error: {e:?}")))?;
        budget.next_entry()?;
        let filename = entry
            .file_path()
            .try_normalize()
            .map_err(|e| invalid(format!("failed to normalize zip path: {e:?}")))?
            .as_ref()
            .to_string();
        let out_path = out_dir.join(checked_relative(&filename)?);

        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        let wayfinder = entry.wayfinder();
        let slice_entry = archive
            .get_entry(wayfinder)
            .map_err(|e| invalid(format!("failed to read zip entry {filename}: {e:?}")))?;
        let data = slice_entry.data();
        match entry.compression_method() {
            rawzip::CompressionMethod::Store => budget.copy(data, &out_path)?,
            rawzip::CompressionMethod::Deflate => {
                budget.copy(flate2::read::DeflateDecoder::new(data), &out_path)?
            }
            method => {
                return Err(invalid(format!(
                    "unsupported zip compression method: {method:?}"
                )));
            }
        }
    }
    Ok(())
}

fn extract_tar_gz(bytes: &[u8], out_dir: &Path) -> Result<(), PlugdeskError> {
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(bytes));
    let mut budget = Budget::new();

    let entries = archive
        .entries()
        .map_err(|e| invalid(format!("invalid tar.gz archive: {e}")))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| invalid(format!("tar entry error: {e}")))?;
        budget.next_entry()?;
        let raw = entry
            .path()
            .map_err(|e| invalid(format!("tar entry has an invalid path: {e}")))?
            .to_string_lossy()
            .into_owned();
        let relative = checked_relative(&raw)?;
        if relative.as_os_str().is_empty() || relative == Path::new(".") {
            continue;
        }
        let out_path = out_dir.join(relative);

        let kind = entry.header().entry_type();
        if kind.is_dir() {
            std::fs::create_dir_all(&out_path)?;
        } else if kind.is_file() {
            #[cfg(unix)]
            let mode = entry.header().mode().ok();
            budget.copy(&mut entry, &out_path)?;
            #[cfg(unix)]
            if let Some(mode) = mode {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(
                    &out_path,
                    std::fs::Permissions::from_mode(mode & 0o755),
                )?;
            }
        } else {
            // Links and device nodes could point outside the bundle.
            return Err(invalid(format!("unsupported tar entry type for {raw}")));
        }
    }
    Ok(())
}
