//! Per-module persisted state (component C4): fingerprint, recorded
//! executions, and free-form side-output properties, serialized as XML.

use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::Path;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use tracing::instrument;

use crate::error::{CacheError, CacheResult};
use crate::execution::ExecutionEntry;
use crate::fingerprint::{hex, parse_hex, Fingerprint};
use crate::xml::{self, xml_err};

#[derive(Debug, Clone)]
pub struct ProjectState {
    pub group_id: String,
    pub artifact_id: String,
    pub fingerprint: Fingerprint,
    pub executions: Vec<ExecutionEntry>,
    pub output_properties: BTreeMap<String, String>,
}

impl ProjectState {
    pub fn new(group_id: impl Into<String>, artifact_id: impl Into<String>, fingerprint: Fingerprint) -> Self {
        ProjectState {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            fingerprint,
            executions: Vec::new(),
            output_properties: BTreeMap::new(),
        }
    }

    /// Keeps every prior execution whose identity is not present among
    /// `new_executions`, then appends `new_executions`; uses
    /// `new_fingerprint` when given, otherwise keeps the prior one; unions
    /// properties with `extra_properties` taking precedence.
    pub fn merge(
        prior: &ProjectState,
        new_executions: Vec<ExecutionEntry>,
        new_fingerprint: Option<Fingerprint>,
        extra_properties: BTreeMap<String, String>,
    ) -> ProjectState {
        let mut executions: Vec<ExecutionEntry> = prior
            .executions
            .iter()
            .filter(|old| !new_executions.iter().any(|new| new.matches(old)))
            .cloned()
            .collect();
        executions.extend(new_executions);

        let mut output_properties = prior.output_properties.clone();
        output_properties.extend(extra_properties);

        ProjectState {
            group_id: prior.group_id.clone(),
            artifact_id: prior.artifact_id.clone(),
            fingerprint: new_fingerprint.unwrap_or_else(|| prior.fingerprint.clone()),
            executions,
            output_properties,
        }
    }

    #[instrument(skip(self), fields(group = %self.group_id, artifact = %self.artifact_id))]
    pub fn save(&self, path: &Path) -> CacheResult<()> {
        let mut writer = xml::new_writer();
        self.write(&mut writer)?;
        let text = xml::finish(writer)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| CacheError::io(parent, e))?;
        }
        std::fs::write(path, text).map_err(|e| CacheError::io(path, e))
    }

    #[instrument(fields(path = %path.display()))]
    pub fn load(path: &Path) -> CacheResult<Option<ProjectState>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(path).map_err(|e| CacheError::io(path, e))?;
        let mut reader = Reader::from_str(&text);
        reader.config_mut().trim_text = true;
        Self::read(&mut reader)
            .map(Some)
            .map_err(|e| CacheError::malformed(path, e.to_string()))
    }

    fn write(&self, writer: &mut Writer<Cursor<Vec<u8>>>) -> CacheResult<()> {
        let mut root = BytesStart::new("project-state");
        root.push_attribute(("group", self.group_id.as_str()));
        root.push_attribute(("artifact", self.artifact_id.as_str()));
        writer.write_event(Event::Start(root)).map_err(xml_err)?;

        let mut files = BytesStart::new("project-files");
        files.push_attribute(("count", self.fingerprint.count.to_string().as_str()));
        files.push_attribute(("last-modified", self.fingerprint.max_mtime_ms.to_string().as_str()));
        if let Some(agg) = self.fingerprint.aggregate_md5 {
            files.push_attribute(("checksum", hex(&agg).as_str()));
        }
        if self.fingerprint.per_file_md5.is_empty() {
            writer.write_event(Event::Empty(files)).map_err(xml_err)?;
        } else {
            writer.write_event(Event::Start(files)).map_err(xml_err)?;
            for (path, digest) in &self.fingerprint.per_file_md5 {
                let mut file = BytesStart::new("file");
                file.push_attribute(("checksum", hex(digest).as_str()));
                writer.write_event(Event::Start(file)).map_err(xml_err)?;
                writer.write_event(Event::Text(BytesText::new(path))).map_err(xml_err)?;
                writer.write_event(Event::End(BytesEnd::new("file"))).map_err(xml_err)?;
            }
            writer
                .write_event(Event::End(BytesEnd::new("project-files")))
                .map_err(xml_err)?;
        }

        writer
            .write_event(Event::Start(BytesStart::new("executions")))
            .map_err(xml_err)?;
        for execution in &self.executions {
            let mut exec_tag = BytesStart::new("execution");
            exec_tag.push_attribute(("groupId", execution.plugin_group.as_str()));
            exec_tag.push_attribute(("artifactId", execution.plugin_artifact.as_str()));
            exec_tag.push_attribute(("version", execution.plugin_version.as_str()));
            exec_tag.push_attribute(("goal", execution.goal.as_str()));
            exec_tag.push_attribute(("id", execution.execution_id.as_str()));
            writer.write_event(Event::Start(exec_tag)).map_err(xml_err)?;
            xml::write_config_tree(writer, &execution.config)?;
            writer
                .write_event(Event::End(BytesEnd::new("execution")))
                .map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("executions")))
            .map_err(xml_err)?;

        writer
            .write_event(Event::Start(BytesStart::new("properties")))
            .map_err(xml_err)?;
        for (name, value) in &self.output_properties {
            let mut prop = BytesStart::new("property");
            prop.push_attribute(("name", name.as_str()));
            prop.push_attribute(("value", value.as_str()));
            writer.write_event(Event::Empty(prop)).map_err(xml_err)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new("properties")))
            .map_err(xml_err)?;

        writer
            .write_event(Event::End(BytesEnd::new("project-state")))
            .map_err(xml_err)?;
        Ok(())
    }

    fn read(reader: &mut Reader<&[u8]>) -> CacheResult<ProjectState> {
        let mut group_id = String::new();
        let mut artifact_id = String::new();
        let mut fingerprint = Fingerprint::empty();
        let mut executions = Vec::new();
        let mut output_properties = BTreeMap::new();

        loop {
            match reader.read_event().map_err(xml_err)? {
                Event::Start(tag) if tag.name().as_ref() == b"project-state" => {
                    for attr in tag.attributes() {
                        let attr = attr.map_err(xml_err)?;
                        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
                        match attr.key.as_ref() {
                            b"group" => group_id = value,
                            b"artifact" => artifact_id = value,
                            _ => {}
                        }
                    }
                }
                Event::Start(tag) if tag.name().as_ref() == b"project-files" => {
                    for attr in tag.attributes() {
                        let attr = attr.map_err(xml_err)?;
                        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
                        match attr.key.as_ref() {
                            b"count" => {
                                fingerprint.count = value
                                    .parse()
                                    .map_err(|_| CacheError::malformed("<project-files>", "bad count"))?
                            }
                            b"last-modified" => {
                                fingerprint.max_mtime_ms = value
                                    .parse()
                                    .map_err(|_| CacheError::malformed("<project-files>", "bad last-modified"))?
                            }
                            b"checksum" => fingerprint.aggregate_md5 = parse_hex(&value),
                            _ => {}
                        }
                    }
                    read_project_files(reader, &mut fingerprint)?;
                }
                Event::Empty(tag) if tag.name().as_ref() == b"project-files" => {
                    for attr in tag.attributes() {
                        let attr = attr.map_err(xml_err)?;
                        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
                        match attr.key.as_ref() {
                            b"count" => {
                                fingerprint.count = value
                                    .parse()
                                    .map_err(|_| CacheError::malformed("<project-files>", "bad count"))?
                            }
                            b"last-modified" => {
                                fingerprint.max_mtime_ms = value
                                    .parse()
                                    .map_err(|_| CacheError::malformed("<project-files>", "bad last-modified"))?
                            }
                            b"checksum" => fingerprint.aggregate_md5 = parse_hex(&value),
                            _ => {}
                        }
                    }
                }
                Event::Start(tag) if tag.name().as_ref() == b"execution" => {
                    let mut plugin_group = String::new();
                    let mut plugin_artifact = String::new();
                    let mut plugin_version = String::new();
                    let mut goal = String::new();
                    let mut execution_id = String::new();
                    for attr in tag.attributes() {
                        let attr = attr.map_err(xml_err)?;
                        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
                        match attr.key.as_ref() {
                            b"groupId" => plugin_group = value,
                            b"artifactId" => plugin_artifact = value,
                            b"version" => plugin_version = value,
                            b"goal" => goal = value,
                            b"id" => execution_id = value,
                            _ => {}
                        }
                    }
                    let config = xml::read_config_tree(reader)?;
                    // consume the </execution> closing tag
                    consume_until_end(reader, b"execution")?;
                    executions.push(ExecutionEntry {
                        plugin_group,
                        plugin_artifact,
                        plugin_version,
                        goal,
                        execution_id,
                        config,
                    });
                }
                Event::Empty(tag) if tag.name().as_ref() == b"property" => {
                    let mut name = String::new();
                    let mut value = String::new();
                    for attr in tag.attributes() {
                        let attr = attr.map_err(xml_err)?;
                        let v = attr.unescape_value().map_err(xml_err)?.into_owned();
                        match attr.key.as_ref() {
                            b"name" => name = v,
                            b"value" => value = v,
                            _ => {}
                        }
                    }
                    output_properties.insert(name, value);
                }
                Event::End(tag) if tag.name().as_ref() == b"project-state" => break,
                Event::Eof => {
                    return Err(CacheError::malformed(
                        "<project-state>",
                        "unexpected end of document",
                    ))
                }
                _ => {}
            }
        }

        Ok(ProjectState {
            group_id,
            artifact_id,
            fingerprint,
            executions,
            output_properties,
        })
    }
}

fn read_project_files(reader: &mut Reader<&[u8]>, fingerprint: &mut Fingerprint) -> CacheResult<()> {
    let mut current_path: Option<String> = None;
    let mut current_checksum: Option<crate::fingerprint::Md5Digest> = None;
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(tag) if tag.name().as_ref() == b"file" => {
                for attr in tag.attributes() {
                    let attr = attr.map_err(xml_err)?;
                    if attr.key.as_ref() == b"checksum" {
                        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
                        current_checksum = parse_hex(&value);
                    }
                }
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(xml_err)?.into_owned();
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    current_path = Some(trimmed.to_string());
                }
            }
            Event::End(tag) if tag.name().as_ref() == b"file" => {
                if let (Some(path), Some(checksum)) = (current_path.take(), current_checksum.take()) {
                    fingerprint.per_file_md5.insert(path, checksum);
                }
            }
            Event::End(tag) if tag.name().as_ref() == b"project-files" => return Ok(()),
            Event::Eof => {
                return Err(CacheError::malformed(
                    "<project-files>",
                    "unexpected end of document",
                ))
            }
            _ => {}
        }
    }
}

fn consume_until_end(reader: &mut Reader<&[u8]>, tag_name: &[u8]) -> CacheResult<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::End(tag) if tag.name().as_ref() == tag_name => return Ok(()),
            Event::Eof => {
                return Err(CacheError::malformed(
                    "<xml>",
                    format!("missing closing tag for {}", String::from_utf8_lossy(tag_name)),
                ))
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_tree::ConfigTree;
    use tempfile::tempdir;

    fn sample_state() -> ProjectState {
        let mut fp = Fingerprint::empty();
        fp.count = 1;
        fp.max_mtime_ms = 1000;
        fp.aggregate_md5 = Some([1u8; 16]);

        let mut state = ProjectState::new("g", "a", fp);
        let mut config = ConfigTree::new("configuration");
        let root = config.root();
        config.add_child(root, "arg", Some("-O2".to_string()));
        state.executions.push(ExecutionEntry {
            plugin_group: "p".to_string(),
            plugin_artifact: "q".to_string(),
            plugin_version: "1".to_string(),
            goal: "pkg".to_string(),
            execution_id: "default-pkg".to_string(),
            config,
        });
        state.output_properties.insert("resource.dir".to_string(), "target/gen".to_string());
        state
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.xml");
        let state = sample_state();
        state.save(&path).unwrap();

        let loaded = ProjectState::load(&path).unwrap().unwrap();
        assert_eq!(loaded.group_id, "g");
        assert_eq!(loaded.artifact_id, "a");
        assert_eq!(loaded.fingerprint.count, 1);
        assert_eq!(loaded.fingerprint.max_mtime_ms, 1000);
        assert_eq!(loaded.fingerprint.aggregate_md5, Some([1u8; 16]));
        assert_eq!(loaded.executions.len(), 1);
        assert_eq!(loaded.executions[0].name(), "p:q:1:pkg@default-pkg");
        let children = loaded.executions[0].config.children(loaded.executions[0].config.root());
        assert_eq!(loaded.executions[0].config.value(children[0]), Some("-O2"));
        assert_eq!(loaded.output_properties.get("resource.dir"), Some(&"target/gen".to_string()));
    }

    #[test]
    fn load_of_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.xml");
        assert!(ProjectState::load(&path).unwrap().is_none());
    }

    #[test]
    fn merge_drops_superseded_identities_and_keeps_unrelated_ones() {
        let prior = sample_state();
        let new_execution = ExecutionEntry {
            plugin_group: "p".to_string(),
            plugin_artifact: "q".to_string(),
            plugin_version: "1".to_string(),
            goal: "pkg".to_string(),
            execution_id: "default-pkg".to_string(),
            config: ConfigTree::new("configuration"),
        };
        let mut new_fp = prior.fingerprint.clone();
        new_fp.max_mtime_ms += 1;

        let merged = ProjectState::merge(&prior, vec![new_execution], Some(new_fp.clone()), BTreeMap::new());
        assert_eq!(merged.executions.len(), 1);
        assert_eq!(merged.fingerprint.max_mtime_ms, new_fp.max_mtime_ms);
        assert_eq!(
            merged.output_properties.get("resource.dir"),
            Some(&"target/gen".to_string())
        );
    }
}
