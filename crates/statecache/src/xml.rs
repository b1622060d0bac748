//! Manual XML (de)serialization building blocks.
//!
//! [`crate::config_tree::ConfigTree`] has per-node dynamic element names,
//! which doesn't fit a fixed `serde` derive schema, so the whole
//! persistence layer (state files, archive index) is written by hand
//! against quick-xml's streaming reader/writer, matching the design note
//! calling for "a streaming pull-parser with explicit schemas".

use std::io::Cursor;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::config_tree::{ConfigTree, NodeId};
use crate::error::{CacheError, CacheResult};

pub fn xml_err<E: std::fmt::Display>(e: E) -> CacheError {
    CacheError::malformed("<xml>", e.to_string())
}

pub fn write_config_tree(writer: &mut Writer<Cursor<Vec<u8>>>, tree: &ConfigTree) -> CacheResult<()> {
    write_node(writer, tree, tree.root())
}

fn write_node(writer: &mut Writer<Cursor<Vec<u8>>>, tree: &ConfigTree, node: NodeId) -> CacheResult<()> {
    let mut start = BytesStart::new(tree.name(node));
    for (k, v) in tree.attributes(node) {
        start.push_attribute((k.as_str(), v.as_str()));
    }

    let children = tree.children(node);
    let value = tree.value(node);

    if children.is_empty() && value.is_none() {
        writer.write_event(Event::Empty(start)).map_err(xml_err)?;
        return Ok(());
    }

    writer.write_event(Event::Start(start)).map_err(xml_err)?;
    if let Some(v) = value {
        writer.write_event(Event::Text(BytesText::new(v))).map_err(xml_err)?;
    }
    for &child in children {
        write_node(writer, tree, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(tree.name(node))))
        .map_err(xml_err)?;
    Ok(())
}

/// Reads a single configuration element (and its subtree) starting at the
/// next `Start`/`Empty` event the reader produces.
pub fn read_config_tree(reader: &mut Reader<&[u8]>) -> CacheResult<ConfigTree> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(start) => {
                let name = tag_name(&start)?;
                let mut tree = ConfigTree::new(name);
                let root = tree.root();
                apply_attributes(&start, &mut tree, root)?;
                read_children(reader, &mut tree, root)?;
                return Ok(tree);
            }
            Event::Empty(start) => {
                let name = tag_name(&start)?;
                let mut tree = ConfigTree::new(name);
                let root = tree.root();
                apply_attributes(&start, &mut tree, root)?;
                return Ok(tree);
            }
            Event::Eof => {
                return Err(CacheError::malformed(
                    "<config>",
                    "unexpected end of document while reading a configuration element",
                ))
            }
            _ => continue,
        }
    }
}

fn read_children(reader: &mut Reader<&[u8]>, tree: &mut ConfigTree, parent: NodeId) -> CacheResult<()> {
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(start) => {
                let name = tag_name(&start)?;
                let child = tree.add_child(parent, name, None);
                apply_attributes(&start, tree, child)?;
                read_children(reader, tree, child)?;
            }
            Event::Empty(start) => {
                let name = tag_name(&start)?;
                let child = tree.add_child(parent, name, None);
                apply_attributes(&start, tree, child)?;
            }
            Event::Text(text) => {
                let value = text.unescape().map_err(xml_err)?.into_owned();
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    tree.set_value(parent, Some(trimmed.to_string()));
                }
            }
            Event::End(_) => return Ok(()),
            Event::Eof => {
                return Err(CacheError::malformed(
                    "<config>",
                    "unexpected end of document while reading configuration children",
                ))
            }
            _ => {}
        }
    }
}

fn tag_name(start: &BytesStart) -> CacheResult<String> {
    Ok(String::from_utf8_lossy(start.name().as_ref()).into_owned())
}

fn apply_attributes(start: &BytesStart, tree: &mut ConfigTree, node: NodeId) -> CacheResult<()> {
    for attr in start.attributes() {
        let attr = attr.map_err(xml_err)?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr.unescape_value().map_err(xml_err)?.into_owned();
        tree.set_attribute(node, key, value);
    }
    Ok(())
}

pub fn new_writer() -> Writer<Cursor<Vec<u8>>> {
    Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2)
}

pub fn finish(writer: Writer<Cursor<Vec<u8>>>) -> CacheResult<String> {
    let bytes = writer.into_inner().into_inner();
    String::from_utf8(bytes).map_err(|e| CacheError::malformed("<xml>", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_nested_tree_with_attributes_and_value() {
        let mut tree = ConfigTree::new("configuration");
        let root = tree.root();
        tree.set_attribute(root, "enabled", "true");
        let arg = tree.add_child(root, "arg", Some("-O2".to_string()));
        tree.set_attribute(arg, "index", "0");

        let mut writer = new_writer();
        write_config_tree(&mut writer, &tree).unwrap();
        let xml = finish(writer).unwrap();

        let mut reader = Reader::from_str(&xml);
        reader.config_mut().trim_text = true;
        let read_back = read_config_tree(&mut reader).unwrap();

        assert_eq!(read_back.name(read_back.root()), "configuration");
        assert_eq!(read_back.attributes(read_back.root()), &[("enabled".to_string(), "true".to_string())]);
        let children = read_back.children(read_back.root());
        assert_eq!(children.len(), 1);
        assert_eq!(read_back.value(children[0]), Some("-O2"));
    }

    #[test]
    fn empty_leaf_round_trips_as_empty_element() {
        let mut tree = ConfigTree::new("configuration");
        let root = tree.root();
        tree.add_child(root, "flag", None);

        let mut writer = new_writer();
        write_config_tree(&mut writer, &tree).unwrap();
        let xml = finish(writer).unwrap();
        assert!(xml.contains("<flag/>") || xml.contains("<flag />"));

        let mut reader = Reader::from_str(&xml);
        reader.config_mut().trim_text = true;
        let read_back = read_config_tree(&mut reader).unwrap();
        let children = read_back.children(read_back.root());
        assert_eq!(read_back.value(children[0]), None);
    }
}
