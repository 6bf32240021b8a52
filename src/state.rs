//! Persistence of the filter tree as XML.
//!
//! The state file carries one element per filter, nested to mirror the tree,
//! with the filter's persisted key/value pairs as child elements:
//!
//! ```xml
//! <aptflow version="0.3.0">
//!   <filtertree>
//!     <filter type="dataload" label="Pos Data">
//!       <file value="./run042.pos"/>
//!       ...
//!       <filter type="rangefile" label="Ranging">...</filter>
//!     </filter>
//!   </filtertree>
//! </aptflow>
//! ```
//!
//! Paths are stored in forward-slash form and converted to native separators
//! at load; paths beginning with `./` are resolved against the state file's
//! directory. Range-file contents are not inlined, only referenced.

use std::fs;
use std::path::{Path, PathBuf};

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::filter::{Filter, FilterKind};
use crate::result::{state_error, StateError};
use crate::stream::FilterId;
use crate::tree::FilterTree;

/// Ambient information available while restoring persisted values.
pub struct StateContext {
    state_dir: PathBuf,
}

impl StateContext {
    pub fn new(state_dir: &Path) -> StateContext {
        StateContext {
            state_dir: state_dir.to_path_buf(),
        }
    }

    /// Converts a stored path to native form, resolving `./`-relative paths
    /// against the state file's directory.
    pub fn decode_path(&self, stored: &str) -> String {
        let native = if cfg!(windows) {
            stored.replace('/', "\\")
        } else {
            stored.to_string()
        };
        match stored.strip_prefix("./") {
            Some(relative) => self
                .state_dir
                .join(relative)
                .to_string_lossy()
                .into_owned(),
            None => native,
        }
    }
}

/// Converts a native path to the canonical stored form.
pub(crate) fn encode_path(path: &str) -> String {
    path.replace('\\', "/")
}

/// Parses the `0`/`1` boolean form used throughout state files.
pub(crate) fn state_bool(value: &str) -> Result<bool, StateError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        _ => state_error(format!("expected 0 or 1, found `{value}`")),
    }
}

/// Serialises a filter tree to its XML state form.
pub fn render_state(tree: &FilterTree) -> String {
    let mut out = String::new();
    out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!(
        "<aptflow version=\"{}\">\n",
        env!("CARGO_PKG_VERSION")
    ));
    out.push_str("\t<filtertree>\n");
    for id in tree.ids() {
        if tree.parent_of(id).is_none() {
            write_filter(tree, id, 2, &mut out);
        }
    }
    out.push_str("\t</filtertree>\n");
    out.push_str("</aptflow>\n");
    out
}

fn write_filter(tree: &FilterTree, id: FilterId, depth: usize, out: &mut String) {
    let filter = tree.filter(id).expect("id came from the tree");
    let tabs = "\t".repeat(depth);
    out.push_str(&format!(
        "{tabs}<filter type=\"{}\" label=\"{}\">\n",
        filter.kind().type_name(),
        escape(filter.label())
    ));
    for (tag, value) in filter.state_tags() {
        out.push_str(&format!(
            "{tabs}\t<{tag} value=\"{}\"/>\n",
            escape(&value)
        ));
    }
    for child in tree.children_of(id) {
        write_filter(tree, child, depth + 1, out);
    }
    out.push_str(&format!("{tabs}</filter>\n"));
}

/// Writes the tree's state to disk.
pub fn save_state(tree: &FilterTree, path: &Path) -> Result<(), StateError> {
    fs::write(path, render_state(tree)).map_err(StateError::from)
}

/// Reads a state file back into a tree.
pub fn load_state(path: &Path) -> Result<FilterTree, StateError> {
    let content = fs::read_to_string(path)?;
    let state_dir = path.parent().unwrap_or(Path::new("."));
    parse_state(&content, state_dir)
}

/// Parses state XML, resolving relative paths against `state_dir`.
pub fn parse_state(content: &str, state_dir: &Path) -> Result<FilterTree, StateError> {
    let context = StateContext::new(state_dir);
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut tree = FilterTree::new();
    let mut stack: Vec<FilterId> = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Start(element) => {
                handle_element(&element, true, &mut tree, &mut stack, &context)?;
            }
            Event::Empty(element) => {
                handle_element(&element, false, &mut tree, &mut stack, &context)?;
            }
            Event::End(element) => {
                if element.name().as_ref() == b"filter" {
                    if stack.pop().is_none() {
                        return state_error("unbalanced </filter>");
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if !stack.is_empty() {
        return state_error("unterminated <filter> element");
    }
    Ok(tree)
}

fn handle_element(
    element: &BytesStart<'_>,
    has_body: bool,
    tree: &mut FilterTree,
    stack: &mut Vec<FilterId>,
    context: &StateContext,
) -> Result<(), StateError> {
    let name = element.name();
    let name = std::str::from_utf8(name.as_ref())
        .map_err(|_| StateError::Malformed {
            description: "non-UTF8 element name".to_string(),
        })?
        .to_string();

    match name.as_str() {
        "aptflow" | "filtertree" => Ok(()),
        "filter" => {
            let type_name = attribute(element, "type")?.ok_or_else(|| StateError::Malformed {
                description: "<filter> without a type attribute".to_string(),
            })?;
            let kind = FilterKind::from_type_name(&type_name)
                .ok_or(StateError::UnknownFilter { name: type_name })?;
            let mut filter = Filter::default_of_kind(kind);
            if let Some(label) = attribute(element, "label")? {
                filter.set_label(&label);
            }
            let parent = stack.last().copied();
            let id = tree
                .add_filter(filter, parent)
                .expect("parent id came from the stack");
            if has_body {
                stack.push(id);
            }
            Ok(())
        }
        tag => {
            let Some(&current) = stack.last() else {
                return state_error(format!("element <{tag}> outside any <filter>"));
            };
            let value = attribute(element, "value")?.ok_or_else(|| StateError::Malformed {
                description: format!("<{tag}> without a value attribute"),
            })?;
            tree.filter_mut(current)
                .expect("stack ids are live")
                .restore_tag(tag, &value, context)
        }
    }
}

fn attribute(element: &BytesStart<'_>, name: &str) -> Result<Option<String>, StateError> {
    let attr = element
        .try_get_attribute(name)
        .map_err(quick_xml::Error::from)?;
    match attr {
        Some(attr) => {
            let value = attr.unescape_value()?;
            Ok(Some(value.into_owned()))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::data_load::{DataLoadFilter, KEY_FILE};
    use crate::filter::spectrum::{SpectrumFilter, KEY_BIN_WIDTH, KEY_LOG_Y};
    use crate::filter::{FilterOps, PropertyValue, RangingFilter};

    fn sample_tree() -> FilterTree {
        let mut tree = FilterTree::new();
        let mut load = DataLoadFilter::new();
        load.set_property(KEY_FILE, &PropertyValue::String("data/run042.pos".into()));
        let load_id = tree.add_filter(Filter::DataLoad(load), None).unwrap();
        let ranging = tree
            .add_filter(Filter::Ranging(RangingFilter::new()), Some(load_id))
            .unwrap();
        let mut spectrum = SpectrumFilter::new();
        spectrum.set_property(KEY_BIN_WIDTH, &PropertyValue::Real(0.25));
        spectrum.set_property(KEY_LOG_Y, &PropertyValue::Bool(false));
        spectrum.set_label("mass spectrum & counts");
        tree.add_filter(Filter::Spectrum(spectrum), Some(ranging))
            .unwrap();
        tree
    }

    #[test]
    fn round_trip_preserves_structure_and_properties() {
        let tree = sample_tree();
        let xml = render_state(&tree);
        let restored = parse_state(&xml, Path::new("/tmp")).expect("parse failed");

        assert_eq!(restored.len(), tree.len());
        let original_ids = tree.ids();
        let restored_ids = restored.ids();
        for (a, b) in original_ids.iter().zip(&restored_ids) {
            let fa = tree.filter(*a).unwrap();
            let fb = restored.filter(*b).unwrap();
            assert_eq!(fa.kind(), fb.kind());
            assert_eq!(fa.label(), fb.label());
            assert_eq!(fa.properties(), fb.properties());
        }
        // Topology preserved: root -> ranging -> spectrum
        assert_eq!(restored.children_of(restored_ids[0]).len(), 1);
        assert_eq!(restored.children_of(restored_ids[1]).len(), 1);
    }

    #[test]
    fn labels_are_escaped() {
        let tree = sample_tree();
        let xml = render_state(&tree);
        assert!(xml.contains("mass spectrum &amp; counts"));
        let restored = parse_state(&xml, Path::new(".")).unwrap();
        let spectrum_id = restored.ids()[2];
        assert_eq!(
            restored.filter(spectrum_id).unwrap().label(),
            "mass spectrum & counts"
        );
    }

    #[test]
    fn relative_paths_resolve_against_state_dir() {
        let xml = "<aptflow version=\"0\"><filtertree>\
            <filter type=\"dataload\" label=\"d\">\
            <file value=\"./ions/run.pos\"/>\
            </filter></filtertree></aptflow>";
        let tree = parse_state(xml, Path::new("/data/states")).unwrap();
        let id = tree.ids()[0];
        let Filter::DataLoad(load) = tree.filter(id).unwrap() else {
            panic!("expected a dataload filter");
        };
        assert_eq!(load.file_path(), "/data/states/ions/run.pos");
    }

    #[test]
    fn unknown_filter_type_is_rejected() {
        let xml = "<aptflow><filtertree>\
            <filter type=\"quantum\" label=\"q\"/>\
            </filtertree></aptflow>";
        assert!(matches!(
            parse_state(xml, Path::new(".")),
            Err(StateError::UnknownFilter { .. })
        ));
    }

    #[test]
    fn stray_tags_are_rejected() {
        let xml = "<aptflow><filtertree><binwidth value=\"1\"/></filtertree></aptflow>";
        assert!(matches!(
            parse_state(xml, Path::new(".")),
            Err(StateError::Malformed { .. })
        ));
    }

    #[test]
    fn save_and_load_via_disk() {
        let tree = sample_tree();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("analysis.xml");
        save_state(&tree, &path).unwrap();
        let restored = load_state(&path).unwrap();
        assert_eq!(restored.len(), 3);
    }
}
