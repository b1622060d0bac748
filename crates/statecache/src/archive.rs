//! Whole-workspace archive save/restore (component C8): per-module build
//! outputs and locally-published artifacts packaged into a single TAR, with
//! an index binding opaque entry IDs to their destination paths.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Reader;
use tracing::{info, instrument, warn};
use walkdir::WalkDir;

use crate::error::{CacheError, CacheResult};
use crate::pattern::{relativize, to_posix_string, FileFilter};
use crate::xml::{self, xml_err};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub relative_path: String,
    pub archive_entry_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectArchiveEntry {
    pub group_id: String,
    pub artifact_id: String,
    pub build_dir_relative_to_session_root: String,
    pub build_files: Vec<FileEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveIndex {
    pub projects: Vec<ProjectArchiveEntry>,
    pub repo_files: Vec<FileEntry>,
}

pub struct ModuleArchiveInput<'a> {
    pub group_id: String,
    pub artifact_id: String,
    pub build_dir: &'a Path,
    pub build_files_excludes: Vec<String>,
}

/// Walks each module's build directory and every given repository artifact
/// path, assigns each a fresh monotonic entry ID, and writes a single gzip
/// TAR containing the files plus a trailing `index.xml`.
#[instrument(skip(modules, repo_artifact_files), fields(archive_path = %archive_path.display()))]
pub fn save(
    archive_path: &Path,
    session_root: &Path,
    local_repo_root: &Path,
    modules: &[ModuleArchiveInput],
    repo_artifact_files: &[PathBuf],
) -> CacheResult<()> {
    let file = File::create(archive_path).map_err(|e| CacheError::io(archive_path, e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);

    let mut counter: u64 = 0;
    let mut index = ArchiveIndex::default();

    for module in modules {
        let filter = FileFilter::from_patterns(&[], &module.build_files_excludes)?;
        let mut build_files = Vec::new();

        for entry in WalkDir::new(module.build_dir).into_iter() {
            let entry = match entry {
                Ok(e) => e,
                Err(err) => {
                    warn!(error = %err, "skipping unreadable entry while archiving build dir");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = relativize(module.build_dir, entry.path());
            let relative_str = to_posix_string(&relative);
            if !filter.matches(&relative_str) {
                continue;
            }
            counter += 1;
            let id = counter.to_string();
            builder
                .append_path_with_name(entry.path(), &id)
                .map_err(|e| CacheError::io(entry.path(), e))?;
            build_files.push(FileEntry {
                relative_path: relative_str,
                archive_entry_id: id,
            });
        }

        let build_dir_relative = to_posix_string(&relativize(session_root, module.build_dir));
        index.projects.push(ProjectArchiveEntry {
            group_id: module.group_id.clone(),
            artifact_id: module.artifact_id.clone(),
            build_dir_relative_to_session_root: build_dir_relative,
            build_files,
        });
    }

    for artifact_path in repo_artifact_files {
        if !artifact_path.exists() {
            continue;
        }
        let relative_str = to_posix_string(&relativize(local_repo_root, artifact_path));
        counter += 1;
        let id = counter.to_string();
        builder
            .append_path_with_name(artifact_path, &id)
            .map_err(|e| CacheError::io(artifact_path, e))?;
        index.repo_files.push(FileEntry {
            relative_path: relative_str,
            archive_entry_id: id,
        });
    }

    let index_xml = write_index(&index)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(index_xml.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, "index.xml", index_xml.as_bytes())
        .map_err(|e| CacheError::io(archive_path, e))?;

    let encoder = builder.into_inner().map_err(|e| CacheError::io(archive_path, e))?;
    encoder.finish().map_err(|e| CacheError::io(archive_path, e))?;

    info!(
        projects = index.projects.len(),
        repo_files = index.repo_files.len(),
        "wrote incremental build archive"
    );
    Ok(())
}

fn open_archive(path: &Path) -> CacheResult<tar::Archive<GzDecoder<File>>> {
    let file = File::open(path).map_err(|e| CacheError::io(path, e))?;
    Ok(tar::Archive::new(GzDecoder::new(file)))
}

/// Scans the whole archive once, returning the parsed index plus the set of
/// entry names actually present in the tar body (used to validate the index
/// doesn't reference a missing entry).
fn load_index_and_entry_names(archive_path: &Path) -> CacheResult<(ArchiveIndex, HashSet<String>)> {
    let mut archive = open_archive(archive_path)?;
    let mut names = HashSet::new();
    let mut index = None;

    let entries = archive.entries().map_err(|e| CacheError::io(archive_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CacheError::io(archive_path, e))?;
        let name = entry
            .path()
            .map_err(|e| CacheError::io(archive_path, e))?
            .to_string_lossy()
            .into_owned();
        if name == "index.xml" {
            let mut contents = String::new();
            entry
                .read_to_string(&mut contents)
                .map_err(|e| CacheError::io(archive_path, e))?;
            index = Some(read_index(&contents)?);
        } else {
            names.insert(name);
        }
    }

    let index = index.ok_or_else(|| CacheError::malformed(archive_path, "archive has no index.xml entry"))?;
    Ok((index, names))
}

fn validate_index(index: &ArchiveIndex, entry_names: &HashSet<String>, archive_path: &Path) -> CacheResult<()> {
    for file in &index.repo_files {
        if !entry_names.contains(&file.archive_entry_id) {
            return Err(CacheError::malformed(
                archive_path,
                format!("index references missing entry id {}", file.archive_entry_id),
            ));
        }
    }
    for project in &index.projects {
        for file in &project.build_files {
            if !entry_names.contains(&file.archive_entry_id) {
                return Err(CacheError::malformed(
                    archive_path,
                    format!("index references missing entry id {}", file.archive_entry_id),
                ));
            }
        }
    }
    Ok(())
}

fn extract_matching(archive_path: &Path, wanted: &HashMap<String, PathBuf>) -> CacheResult<()> {
    if wanted.is_empty() {
        return Ok(());
    }
    let mut archive = open_archive(archive_path)?;
    let entries = archive.entries().map_err(|e| CacheError::io(archive_path, e))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| CacheError::io(archive_path, e))?;
        let name = entry
            .path()
            .map_err(|e| CacheError::io(archive_path, e))?
            .to_string_lossy()
            .into_owned();
        if let Some(dest) = wanted.get(&name) {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
            }
            entry.unpack(dest).map_err(|e| CacheError::io(dest, e))?;
        }
    }
    Ok(())
}

/// Restores an archive in two passes: repository files first (so later
/// modules can resolve them), then each module's build files, filtered by
/// its *current* excludes and never overwriting a file already present.
#[instrument(skip(module_live_excludes), fields(archive_path = %archive_path.display()))]
pub fn load(
    archive_path: &Path,
    session_root: &Path,
    local_repo_root: &Path,
    module_live_excludes: &HashMap<(String, String), Vec<String>>,
) -> CacheResult<ArchiveIndex> {
    if !archive_path.exists() {
        warn!("archive file does not exist, skipping load");
        return Ok(ArchiveIndex::default());
    }

    let (index, entry_names) = load_index_and_entry_names(archive_path)?;
    validate_index(&index, &entry_names, archive_path)?;

    let mut repo_targets = HashMap::new();
    for file in &index.repo_files {
        repo_targets.insert(file.archive_entry_id.clone(), local_repo_root.join(&file.relative_path));
    }
    extract_matching(archive_path, &repo_targets)?;

    let mut build_targets = HashMap::new();
    for project in &index.projects {
        let key = (project.group_id.clone(), project.artifact_id.clone());
        let excludes = module_live_excludes.get(&key).cloned().unwrap_or_default();
        let filter = FileFilter::from_patterns(&[], &excludes)?;
        let build_dir = session_root.join(&project.build_dir_relative_to_session_root);
        for file in &project.build_files {
            if !filter.matches(&file.relative_path) {
                continue;
            }
            let dest = build_dir.join(&file.relative_path);
            if dest.exists() {
                continue;
            }
            build_targets.insert(file.archive_entry_id.clone(), dest);
        }
    }
    extract_matching(archive_path, &build_targets)?;

    Ok(index)
}

fn write_index(index: &ArchiveIndex) -> CacheResult<String> {
    let mut writer = xml::new_writer();
    writer
        .write_event(Event::Start(BytesStart::new("index")))
        .map_err(xml_err)?;

    writer
        .write_event(Event::Start(BytesStart::new("projects")))
        .map_err(xml_err)?;
    for project in &index.projects {
        let mut tag = BytesStart::new("project");
        tag.push_attribute(("group", project.group_id.as_str()));
        tag.push_attribute(("artifact", project.artifact_id.as_str()));
        tag.push_attribute(("buildDir", project.build_dir_relative_to_session_root.as_str()));
        writer.write_event(Event::Start(tag)).map_err(xml_err)?;
        write_file_entries(&mut writer, &project.build_files)?;
        writer
            .write_event(Event::End(BytesEnd::new("project")))
            .map_err(xml_err)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("projects")))
        .map_err(xml_err)?;

    writer
        .write_event(Event::Start(BytesStart::new("repo-files")))
        .map_err(xml_err)?;
    write_file_entries(&mut writer, &index.repo_files)?;
    writer
        .write_event(Event::End(BytesEnd::new("repo-files")))
        .map_err(xml_err)?;

    writer
        .write_event(Event::End(BytesEnd::new("index")))
        .map_err(xml_err)?;

    xml::finish(writer)
}

fn write_file_entries(writer: &mut quick_xml::Writer<std::io::Cursor<Vec<u8>>>, files: &[FileEntry]) -> CacheResult<()> {
    for file in files {
        let mut tag = BytesStart::new("file");
        tag.push_attribute(("id", file.archive_entry_id.as_str()));
        writer.write_event(Event::Start(tag)).map_err(xml_err)?;
        writer
            .write_event(Event::Text(BytesText::new(&file.relative_path)))
            .map_err(xml_err)?;
        writer
            .write_event(Event::End(BytesEnd::new("file")))
            .map_err(xml_err)?;
    }
    Ok(())
}

fn read_index(text: &str) -> CacheResult<ArchiveIndex> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text = true;

    let mut index = ArchiveIndex::default();
    let mut in_repo_files = false;
    let mut current_project: Option<ProjectArchiveEntry> = None;
    let mut current_file_id: Option<String> = None;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(tag) if tag.name().as_ref() == b"project" => {
                let mut group_id = String::new();
                let mut artifact_id = String::new();
                let mut build_dir = String::new();
                for attr in tag.attributes() {
                    let attr = attr.map_err(xml_err)?;
                    let value = attr.unescape_value().map_err(xml_err)?.into_owned();
                    match attr.key.as_ref() {
                        b"group" => group_id = value,
                        b"artifact" => artifact_id = value,
                        b"buildDir" => build_dir = value,
                        _ => {}
                    }
                }
                current_project = Some(ProjectArchiveEntry {
                    group_id,
                    artifact_id,
                    build_dir_relative_to_session_root: build_dir,
                    build_files: Vec::new(),
                });
            }
            Event::End(tag) if tag.name().as_ref() == b"project" => {
                if let Some(project) = current_project.take() {
                    index.projects.push(project);
                }
            }
            Event::Start(tag) if tag.name().as_ref() == b"repo-files" => in_repo_files = true,
            Event::End(tag) if tag.name().as_ref() == b"repo-files" => in_repo_files = false,
            Event::Start(tag) if tag.name().as_ref() == b"file" => {
                for attr in tag.attributes() {
                    let attr = attr.map_err(xml_err)?;
                    if attr.key.as_ref() == b"id" {
                        current_file_id = Some(attr.unescape_value().map_err(xml_err)?.into_owned());
                    }
                }
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(xml_err)?.into_owned();
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    if let Some(id) = current_file_id.take() {
                        let entry = FileEntry {
                            relative_path: trimmed.to_string(),
                            archive_entry_id: id,
                        };
                        if in_repo_files {
                            index.repo_files.push(entry);
                        } else if let Some(project) = current_project.as_mut() {
                            project.build_files.push(entry);
                        }
                    }
                }
            }
            Event::End(tag) if tag.name().as_ref() == b"index" => break,
            Event::Eof => return Err(CacheError::malformed("<index.xml>", "unexpected end of document")),
            _ => {}
        }
    }

    Ok(index)
}
