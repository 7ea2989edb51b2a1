use crate::db::{db_path, DB_FILE};
use anyhow::{anyhow, bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const MANIFEST_ENTRY: &str = "manifest.json";
const DB_ENTRY: &str = "db/campus.sqlite3";
const META_WORKSPACE_ENTRY: &str = "meta/workspace.json";
pub const BUNDLE_FORMAT_V1: &str = "campus-workspace-v1";
const ZIP_MAGIC: [u8; 4] = [0x50, 0x4B, 0x03, 0x04];

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    format: String,
    #[serde(default)]
    version: u32,
    #[serde(default)]
    app_version: String,
    #[serde(default)]
    exported_at: String,
    db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ExportSummary {
    pub bundle_format: String,
    pub entry_count: usize,
    pub db_sha256: String,
}

#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub bundle_format_detected: String,
    pub db_sha256: String,
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn put_entry<W: Write + Seek>(zip: &mut ZipWriter<W>, name: &str, bytes: &[u8]) -> anyhow::Result<()> {
    let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);
    zip.start_file(name, opts)
        .with_context(|| format!("failed to start bundle entry {name}"))?;
    zip.write_all(bytes)
        .with_context(|| format!("failed to write bundle entry {name}"))
}

fn take_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> anyhow::Result<Vec<u8>> {
    let mut entry = archive
        .by_name(name)
        .with_context(|| format!("bundle is missing {name}"))?;
    let mut bytes = Vec::new();
    entry
        .read_to_end(&mut bytes)
        .with_context(|| format!("failed to extract {name}"))?;
    Ok(bytes)
}

/// Zips the workspace database with a manifest carrying its SHA-256.
pub fn export_workspace_bundle(
    workspace_path: &Path,
    out_path: &Path,
) -> anyhow::Result<ExportSummary> {
    let src = db_path(workspace_path);
    let db_bytes =
        std::fs::read(&src).with_context(|| format!("failed to read {}", src.display()))?;
    let manifest = Manifest {
        format: BUNDLE_FORMAT_V1.to_string(),
        version: 1,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        exported_at: crate::workflow::format_ts(chrono::Utc::now()),
        db_sha256: sha256_hex(&db_bytes),
    };
    let meta = json!({
        "sourceWorkspace": workspace_path.to_string_lossy(),
        "dbFile": DB_FILE,
    });

    if let Some(parent) = out_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let out = File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;
    let mut zip = ZipWriter::new(out);
    let entries: [(&str, Vec<u8>); 3] = [
        (MANIFEST_ENTRY, serde_json::to_vec_pretty(&manifest)?),
        (DB_ENTRY, db_bytes),
        (META_WORKSPACE_ENTRY, serde_json::to_vec_pretty(&meta)?),
    ];
    for (name, bytes) in &entries {
        put_entry(&mut zip, name, bytes)?;
    }
    zip.finish().context("failed to finalize bundle")?;

    Ok(ExportSummary {
        bundle_format: manifest.format,
        entry_count: entries.len(),
        db_sha256: manifest.db_sha256,
    })
}

/// Replaces the workspace database with the one inside `in_path`.
/// The caller must have closed its connection first.
pub fn import_workspace_bundle(
    in_path: &Path,
    workspace_path: &Path,
) -> anyhow::Result<ImportSummary> {
    let mut file =
        File::open(in_path).with_context(|| format!("failed to open {}", in_path.display()))?;
    let mut magic = [0u8; 4];
    if file.read_exact(&mut magic).is_err() || magic != ZIP_MAGIC {
        bail!("not a workspace bundle: {}", in_path.display());
    }
    file.rewind()?;
    let mut archive = ZipArchive::new(file).context("invalid zip archive")?;

    let manifest: Manifest = serde_json::from_slice(&take_entry(&mut archive, MANIFEST_ENTRY)?)
        .context("manifest.json is invalid")?;
    if manifest.format != BUNDLE_FORMAT_V1 {
        bail!("unsupported bundle format: {}", manifest.format);
    }
    let db_bytes = take_entry(&mut archive, DB_ENTRY)?;
    let actual = sha256_hex(&db_bytes);
    let expected = manifest.db_sha256.trim().to_ascii_lowercase();
    if actual != expected {
        return Err(anyhow!(
            "database checksum mismatch: manifest {expected} but entry hashes to {actual}"
        ));
    }

    std::fs::create_dir_all(workspace_path)
        .with_context(|| format!("failed to create {}", workspace_path.display()))?;
    // Write beside the target, then swap it in.
    let staged = workspace_path.join(format!("{DB_FILE}.importing"));
    std::fs::write(&staged, &db_bytes)
        .with_context(|| format!("failed to write {}", staged.display()))?;
    let dst = db_path(workspace_path);
    std::fs::rename(&staged, &dst)
        .with_context(|| format!("failed to move database into {}", dst.display()))?;

    Ok(ImportSummary {
        bundle_format_detected: manifest.format,
        db_sha256: actual,
    })
}
