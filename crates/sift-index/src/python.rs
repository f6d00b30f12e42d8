//! Definitions, call sites and name reads of a parsed Python module.

use sift_store::SymbolKind;
use tree_sitter::Node;

/// A `def` or `class` at any nesting depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DefSite {
    pub name: String,
    pub qualname: String,
    pub kind: SymbolKind,
    /// 1-indexed line of the `def`/`class` keyword (decorators excluded).
    pub start_line: u32,
    pub end_line: u32,
    /// Index of the enclosing definition in [`PythonOutline::defs`].
    pub parent: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CallSite {
    /// Index of the innermost enclosing function in [`PythonOutline::defs`].
    pub caller: usize,
    pub callee: String,
    pub line: u32,
}

/// An identifier read as a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NameUse {
    pub name: String,
    pub line: u32,
    /// 0-indexed byte offset within the line.
    pub column: u32,
    pub context: String,
}

#[derive(Debug, Default)]
pub(crate) struct PythonOutline {
    pub defs: Vec<DefSite>,
    pub calls: Vec<CallSite>,
    pub names: Vec<NameUse>,
}

/// Bytes of the source line kept on each side of a name use.
const CONTEXT_BYTES: usize = 40;

struct Frame {
    def: usize,
    callable: bool,
}

/// Walk the whole tree collecting definitions, calls and name reads in source order.
pub(crate) fn outline(root: Node<'_>, source: &str) -> PythonOutline {
    let mut out = PythonOutline::default();
    let mut stack = Vec::new();
    visit(root, source, &mut stack, &mut out);
    out
}

fn visit(node: Node<'_>, source: &str, stack: &mut Vec<Frame>, out: &mut PythonOutline) {
    match node.kind() {
        "function_definition" | "class_definition" => {
            let Some(name_node) = node.child_by_field_name("name") else {
                visit_children(node, source, stack, out);
                return;
            };
            let is_class = node.kind() == "class_definition";
            let parent = stack.last().map(|f| f.def);
            let kind = if is_class {
                SymbolKind::Class
            } else if stack.last().is_some_and(|f| !f.callable) {
                SymbolKind::Method
            } else {
                SymbolKind::Function
            };
            let name = source[name_node.byte_range()].to_owned();
            let qualname = match parent {
                Some(p) => format!("{}.{name}", out.defs[p].qualname),
                None => name.clone(),
            };
            out.defs.push(DefSite {
                name,
                qualname,
                kind,
                start_line: line_of(node.start_position().row),
                end_line: last_line(node),
                parent,
            });
            stack.push(Frame {
                def: out.defs.len() - 1,
                callable: !is_class,
            });
            visit_children(node, source, stack, out);
            stack.pop();
        }
        "call" => {
            if let Some(caller) = stack.iter().rev().find(|f| f.callable)
                && let Some(callee) = node
                    .child_by_field_name("function")
                    .and_then(|f| callee_text(f, source))
            {
                out.calls.push(CallSite {
                    caller: caller.def,
                    callee,
                    line: line_of(node.start_position().row),
                });
            }
            visit_children(node, source, stack, out);
        }
        "identifier" => {
            if reads_name(node) {
                out.names.push(name_use(node, source));
            }
        }
        "import_statement" | "import_from_statement" | "future_import_statement"
        | "global_statement" | "nonlocal_statement" => {}
        _ => visit_children(node, source, stack, out),
    }
}

/// Whether an identifier is read, as opposed to bound or declared.
fn reads_name(node: Node<'_>) -> bool {
    let mut child = node;
    while let Some(parent) = child.parent() {
        let is = move |field: &str| parent.child_by_field_name(field) == Some(child);
        match parent.kind() {
            "pattern_list" | "tuple_pattern" | "list_pattern" | "list_splat_pattern"
            | "dictionary_splat_pattern" => child = parent,
            "attribute" => return !is("attribute"),
            "function_definition" | "class_definition" | "keyword_argument"
            | "default_parameter" | "typed_default_parameter" | "named_expression" => {
                return !is("name");
            }
            "assignment" | "augmented_assignment" | "for_statement" | "for_in_clause" => {
                return !is("left");
            }
            "typed_parameter" => return is("type"),
            "parameters" | "lambda_parameters" | "as_pattern_target" | "aliased_import"
            | "dotted_name" => return false,
            _ => return true,
        }
    }
    true
}

fn name_use(node: Node<'_>, source: &str) -> NameUse {
    let start = node.start_byte();
    let column = node.start_position().column;
    let line_start = start - column;
    let line_end = source[start..]
        .find('\n')
        .map_or(source.len(), |i| start + i);
    let line = &source[line_start..line_end];

    let mut from = column.saturating_sub(CONTEXT_BYTES);
    while !line.is_char_boundary(from) {
        from -= 1;
    }
    let mut to = (node.end_byte() - line_start + CONTEXT_BYTES).min(line.len());
    while !line.is_char_boundary(to) {
        to += 1;
    }
    NameUse {
        name: source[node.byte_range()].to_owned(),
        line: line_of(node.start_position().row),
        column: u32::try_from(column).unwrap_or(u32::MAX),
        context: line[from..to].to_owned(),
    }
}

fn visit_children(node: Node<'_>, source: &str, stack: &mut Vec<Frame>, out: &mut PythonOutline) {
    let mut cursor = node.walk();
    for child in node.named_children(&mut cursor) {
        visit(child, source, stack, out);
    }
}

/// `foo` or a dotted chain such as `self.auth.login`. For a chain rooted in something other
/// than a name (`get_client().send`) only the attribute part is kept.
fn callee_text(node: Node<'_>, source: &str) -> Option<String> {
    match node.kind() {
        "identifier" => Some(source[node.byte_range()].to_owned()),
        "attribute" => {
            let attr = &source[node.child_by_field_name("attribute")?.byte_range()];
            match node
                .child_by_field_name("object")
                .and_then(|obj| callee_text(obj, source))
            {
                Some(base) => Some(format!("{base}.{attr}")),
                None => Some(attr.to_owned()),
            }
        }
        _ => None,
    }
}

/// Last line covered by a node. A node ending at column 0 stops on the previous line.
pub(crate) fn last_line(node: Node<'_>) -> u32 {
    let (start, end) = (node.start_position(), node.end_position());
    if end.column == 0 && end.row > start.row {
        line_of(end.row - 1)
    } else {
        line_of(end.row)
    }
}

fn line_of(row: usize) -> u32 {
    u32::try_from(row + 1).unwrap_or(u32::MAX)
}
