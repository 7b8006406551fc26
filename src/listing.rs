//! Directory listing model: parsing LIST payloads and ordering the result.

use serde::Serialize;

/// What a listing entry is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// The `..` parent entry.
    Up,
    Directory,
    File,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FsNode {
    pub name: String,
    pub kind: NodeKind,
}

impl FsNode {
    fn from_segment(segment: &str) -> Self {
        if segment.eq_ignore_ascii_case("../") {
            FsNode {
                name: "..".to_owned(),
                kind: NodeKind::Up,
            }
        } else if let Some(slash) = segment.find('/') {
            FsNode {
                name: segment[..slash].to_owned(),
                kind: NodeKind::Directory,
            }
        } else {
            FsNode {
                name: segment.to_owned(),
                kind: NodeKind::File,
            }
        }
    }
}

/// Parses a completed LIST payload into sorted nodes.
///
/// The payload is comma-separated: `../` is the parent entry, a trailing
/// slash marks a directory, anything else is a file. Empty segments (an
/// empty directory replies with an empty payload) are skipped.
pub fn parse_listing(payload: &[u8]) -> Vec<FsNode> {
    let text = String::from_utf8_lossy(payload);
    let mut nodes: Vec<FsNode> = text
        .split(',')
        .filter(|s| !s.is_empty())
        .map(FsNode::from_segment)
        .collect();
    sort_nodes(&mut nodes);
    nodes
}

/// Sorts nodes for display: `..` entries first, then directories, then
/// files, each group lexicographic by name. The order is total, so the
/// result never depends on the input order of distinct nodes.
pub fn sort_nodes(nodes: &mut [FsNode]) {
    nodes.sort_by(|a, b| {
        let group = |n: &FsNode| (!n.name.contains(".."), n.kind == NodeKind::File);
        group(a).cmp(&group(b)).then_with(|| a.name.cmp(&b.name))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(nodes: &[FsNode]) -> Vec<&str> {
        nodes.iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn segments_map_to_node_kinds() {
        let nodes = parse_listing(b"../,logs/,readme.txt");
        assert_eq!(
            nodes,
            vec![
                FsNode {
                    name: "..".into(),
                    kind: NodeKind::Up,
                },
                FsNode {
                    name: "logs".into(),
                    kind: NodeKind::Directory,
                },
                FsNode {
                    name: "readme.txt".into(),
                    kind: NodeKind::File,
                },
            ]
        );
    }

    #[test]
    fn up_sorts_first_then_directories_then_files() {
        let nodes = parse_listing(b"z.txt,b/,../,a.txt,a/");
        assert_eq!(names(&nodes), ["..", "a", "b", "a.txt", "z.txt"]);
    }

    #[test]
    fn sort_does_not_depend_on_input_order() {
        let mut a = parse_listing(b"a.txt,z.txt,a/,b/,../");
        let mut b = parse_listing(b"../,b/,a/,z.txt,a.txt");
        sort_nodes(&mut a);
        sort_nodes(&mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_payload_is_an_empty_listing() {
        assert!(parse_listing(b"").is_empty());
    }

    #[test]
    fn up_is_case_insensitive() {
        let nodes = parse_listing(b"../");
        assert_eq!(nodes[0].kind, NodeKind::Up);
    }
}
