use crate::{AttrValue, Attributes, AttractorError, DurationValue, Edge, Graph, Node};
use graphviz_rust::dot_structures::{
    Attribute, Edge as DotEdge, EdgeTy, Graph as DotGraph, GraphAttributes, Id, Node as DotNode,
    NodeId, Stmt, Subgraph, Vertex,
};

/// Attribute defaults and subgraph classes in effect for the current scope.
#[derive(Clone, Debug, Default)]
struct Scope {
    node_defaults: Attributes,
    edge_defaults: Attributes,
    classes: Vec<String>,
}

pub fn parse_dot(source: &str) -> Result<Graph, AttractorError> {
    if contains_undirected_edge(source) {
        return Err(AttractorError::InvalidGraph(
            "undirected edge token '--' is not supported".to_string(),
        ));
    }

    let normalized = quote_duration_literals(source);
    let dot_graph = graphviz_rust::parse(&normalized).map_err(AttractorError::DotParse)?;
    let mut graph = convert_graph(dot_graph)?;
    graph.source_dot = Some(source.to_string());
    Ok(graph)
}

fn convert_graph(dot_graph: DotGraph) -> Result<Graph, AttractorError> {
    let (graph_id, strict, stmts) = match dot_graph {
        DotGraph::DiGraph { id, strict, stmts } => (dot_id_to_string(id)?, strict, stmts),
        DotGraph::Graph { .. } => {
            return Err(AttractorError::InvalidGraph(
                "only 'digraph' is supported".to_string(),
            ));
        }
    };
    if strict {
        return Err(AttractorError::InvalidGraph(
            "'strict' graphs are not supported".to_string(),
        ));
    }

    let mut graph = Graph::new(graph_id);
    process_statements(&mut graph, &stmts, &Scope::default(), true)?;
    Ok(graph)
}

fn process_statements(
    graph: &mut Graph,
    stmts: &[Stmt],
    parent_scope: &Scope,
    top_level: bool,
) -> Result<(), AttractorError> {
    let mut scope = parent_scope.clone();

    for stmt in stmts {
        match stmt {
            Stmt::GAttribute(graph_attrs) => match graph_attrs {
                GraphAttributes::Node(attrs) => {
                    scope.node_defaults.merge_inherited(&parse_attributes(attrs)?);
                }
                GraphAttributes::Edge(attrs) => {
                    scope.edge_defaults.merge_inherited(&parse_attributes(attrs)?);
                }
                GraphAttributes::Graph(attrs) => {
                    if top_level {
                        graph.attrs.merge_inherited(&parse_attributes(attrs)?);
                    }
                }
            },
            Stmt::Attribute(attr) => {
                if top_level {
                    let (key, value) = parse_attribute(attr)?;
                    graph.attrs.set_explicit(key, value);
                }
            }
            Stmt::Node(node) => process_node_stmt(graph, node, &scope)?,
            Stmt::Edge(edge) => process_edge_stmt(graph, edge, &scope)?,
            Stmt::Subgraph(subgraph) => process_subgraph_stmt(graph, subgraph, &scope)?,
        }
    }

    Ok(())
}

fn process_subgraph_stmt(
    graph: &mut Graph,
    subgraph: &Subgraph,
    parent_scope: &Scope,
) -> Result<(), AttractorError> {
    let mut scope = parent_scope.clone();
    if let Some(class_name) = subgraph_class(subgraph)? {
        scope.classes.push(class_name);
    }
    process_statements(graph, &subgraph.stmts, &scope, false)
}

/// Subgraphs with a label contribute a slugified `class` value to the nodes
/// they contain.
fn subgraph_class(subgraph: &Subgraph) -> Result<Option<String>, AttractorError> {
    let mut label: Option<String> = None;

    for stmt in &subgraph.stmts {
        match stmt {
            Stmt::Attribute(Attribute(key, value)) => {
                if id_to_attr_key(key)? == "label" {
                    label = Some(id_to_string(value)?);
                }
            }
            Stmt::GAttribute(GraphAttributes::Graph(attrs)) => {
                for attr in attrs {
                    let (key, value) = parse_attribute(attr)?;
                    if key == "label" {
                        label = Some(value.to_string_value());
                    }
                }
            }
            _ => {}
        }
    }

    Ok(label.and_then(|label| slugify(&label)))
}

fn slugify(label: &str) -> Option<String> {
    let mut out = String::new();
    let mut pending_dash = false;
    for ch in label.trim().to_ascii_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch);
        } else if ch.is_ascii_whitespace() || ch == '-' {
            pending_dash = true;
        }
    }
    if out.is_empty() { None } else { Some(out) }
}

fn process_node_stmt(graph: &mut Graph, node: &DotNode, scope: &Scope) -> Result<(), AttractorError> {
    let node_id = parse_node_id(&node.id)?;

    let mut attrs = scope.node_defaults.without_explicit();
    attrs.merge_with_explicit_tracking(&parse_attributes(&node.attributes)?);

    if !scope.classes.is_empty() {
        let mut classes: Vec<String> = attrs
            .get_str("class")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(ToString::to_string)
            .collect();
        for class_name in &scope.classes {
            if !classes.iter().any(|existing| existing == class_name) {
                classes.push(class_name.clone());
            }
        }
        attrs.set_inherited("class", AttrValue::String(classes.join(",")));
    }

    let entry = graph
        .nodes
        .entry(node_id.clone())
        .or_insert_with(|| Node::new(node_id));
    entry.attrs.merge_with_explicit_tracking(&attrs);
    Ok(())
}

fn process_edge_stmt(graph: &mut Graph, edge: &DotEdge, scope: &Scope) -> Result<(), AttractorError> {
    let vertices = match &edge.ty {
        EdgeTy::Pair(from, to) => vec![parse_vertex(from)?, parse_vertex(to)?],
        EdgeTy::Chain(chain) => {
            let mut result = Vec::with_capacity(chain.len());
            for vertex in chain {
                result.push(parse_vertex(vertex)?);
            }
            result
        }
    };
    if vertices.len() < 2 {
        return Err(AttractorError::InvalidGraph(
            "edge chain must contain at least two vertices".to_string(),
        ));
    }

    let mut attrs = scope.edge_defaults.without_explicit();
    attrs.merge_with_explicit_tracking(&parse_attributes(&edge.attributes)?);

    for pair in vertices.windows(2) {
        for vertex in pair {
            graph
                .nodes
                .entry(vertex.clone())
                .or_insert_with(|| Node::new(vertex.clone()));
        }
        graph.edges.push(Edge {
            from: pair[0].clone(),
            to: pair[1].clone(),
            attrs: attrs.clone(),
        });
    }

    Ok(())
}

fn parse_vertex(vertex: &Vertex) -> Result<String, AttractorError> {
    match vertex {
        Vertex::N(node_id) => parse_node_id(node_id),
        Vertex::S(_) => Err(AttractorError::InvalidGraph(
            "subgraph vertices in edge statements are not supported".to_string(),
        )),
    }
}

fn parse_node_id(node_id: &NodeId) -> Result<String, AttractorError> {
    if node_id.1.is_some() {
        return Err(AttractorError::InvalidGraph(
            "ports in node identifiers are not supported".to_string(),
        ));
    }
    let value = id_to_string(&node_id.0)?;
    if is_valid_identifier(&value) {
        Ok(value)
    } else {
        Err(AttractorError::InvalidGraph(format!(
            "node id '{value}' is invalid; expected [A-Za-z_][A-Za-z0-9_]*"
        )))
    }
}

fn parse_attributes(attrs: &[Attribute]) -> Result<Attributes, AttractorError> {
    let mut parsed = Attributes::new();
    for attr in attrs {
        let (key, value) = parse_attribute(attr)?;
        parsed.set_explicit(key, value);
    }
    Ok(parsed)
}

fn parse_attribute(attr: &Attribute) -> Result<(String, AttrValue), AttractorError> {
    Ok((id_to_attr_key(&attr.0)?, parse_attr_value(&attr.1)?))
}

fn dot_id_to_string(id: Id) -> Result<String, AttractorError> {
    match id {
        Id::Anonymous(value) => Ok(value),
        other => id_to_string(&other),
    }
}

fn id_to_attr_key(id: &Id) -> Result<String, AttractorError> {
    let key = id_to_string(id)?;
    if is_valid_attr_key(&key) {
        Ok(key)
    } else {
        Err(AttractorError::InvalidGraph(format!(
            "invalid attribute key '{key}'"
        )))
    }
}

fn parse_attr_value(id: &Id) -> Result<AttrValue, AttractorError> {
    match id {
        Id::Html(_) => Err(AttractorError::InvalidGraph(
            "HTML attribute values are not supported".to_string(),
        )),
        Id::Escaped(_) => {
            let value = id_to_string(id)?;
            match parse_duration(&value) {
                Some(duration) => Ok(AttrValue::Duration(duration)),
                None => Ok(AttrValue::String(value)),
            }
        }
        Id::Plain(raw) => {
            if raw == "true" {
                return Ok(AttrValue::Boolean(true));
            }
            if raw == "false" {
                return Ok(AttrValue::Boolean(false));
            }
            if let Some(duration) = parse_duration(raw) {
                return Ok(AttrValue::Duration(duration));
            }
            if let Ok(value) = raw.parse::<i64>() {
                return Ok(AttrValue::Integer(value));
            }
            if raw.contains('.') {
                if let Ok(value) = raw.parse::<f64>() {
                    return Ok(AttrValue::Float(value));
                }
            }
            Ok(AttrValue::String(raw.clone()))
        }
        Id::Anonymous(value) => Ok(AttrValue::String(value.clone())),
    }
}

pub fn parse_duration(raw: &str) -> Option<DurationValue> {
    if raw.len() < 2 {
        return None;
    }

    let unit = ["ms", "s", "m", "h", "d"]
        .into_iter()
        .find(|unit| raw.ends_with(unit))?;
    let value = raw[..raw.len() - unit.len()].parse::<u64>().ok()?;
    let factor = match unit {
        "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        _ => return None,
    };

    Some(DurationValue {
        raw: raw.to_string(),
        millis: value.saturating_mul(factor),
    })
}

fn id_to_string(id: &Id) -> Result<String, AttractorError> {
    match id {
        Id::Plain(value) => Ok(value.clone()),
        Id::Escaped(value) => {
            let unquoted = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .ok_or_else(|| {
                    AttractorError::InvalidGraph(format!(
                        "escaped string id '{value}' is missing quotes"
                    ))
                })?;
            Ok(unescape_dot_string(unquoted))
        }
        Id::Html(_) => Err(AttractorError::InvalidGraph(
            "HTML labels/IDs are not supported".to_string(),
        )),
        Id::Anonymous(value) => Ok(value.clone()),
    }
}

fn unescape_dot_string(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            output.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => output.push('\n'),
            Some('t') => output.push('\t'),
            Some('"') => output.push('"'),
            Some('\\') => output.push('\\'),
            Some(other) => output.push(other),
            None => output.push('\\'),
        }
    }

    output
}

fn is_valid_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn is_valid_attr_key(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    value.split('.').all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
            _ => return false,
        }
        chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
    })
}

/// Byte scanner that skips string literals and comments so the raw-source
/// passes below only look at structural characters.
struct SourceScanner<'a> {
    bytes: &'a [u8],
    index: usize,
}

#[derive(Clone, Copy, PartialEq)]
enum ScanToken {
    Structural(u8),
    Quoted(u8),
}

impl<'a> SourceScanner<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            bytes: source.as_bytes(),
            index: 0,
        }
    }

    fn next_token(&mut self) -> Option<(usize, ScanToken)> {
        loop {
            let current = *self.bytes.get(self.index)?;
            let next = self.bytes.get(self.index + 1).copied();

            match current {
                b'/' if next == Some(b'/') => {
                    while self.index < self.bytes.len() && self.bytes[self.index] != b'\n' {
                        self.index += 1;
                    }
                }
                b'/' if next == Some(b'*') => {
                    self.index += 2;
                    while self.index + 1 < self.bytes.len()
                        && !(self.bytes[self.index] == b'*' && self.bytes[self.index + 1] == b'/')
                    {
                        self.index += 1;
                    }
                    self.index = (self.index + 2).min(self.bytes.len());
                }
                b'"' => {
                    let start = self.index;
                    self.index += 1;
                    while self.index < self.bytes.len() {
                        match self.bytes[self.index] {
                            b'\\' => self.index += 2,
                            b'"' => {
                                self.index += 1;
                                break;
                            }
                            _ => self.index += 1,
                        }
                    }
                    return Some((start, ScanToken::Quoted(b'"')));
                }
                other => {
                    let at = self.index;
                    self.index += 1;
                    return Some((at, ScanToken::Structural(other)));
                }
            }
        }
    }
}

fn contains_undirected_edge(source: &str) -> bool {
    let mut scanner = SourceScanner::new(source);
    let mut previous: Option<u8> = None;
    while let Some((_, token)) = scanner.next_token() {
        match token {
            ScanToken::Structural(b'-') if previous == Some(b'-') => return true,
            ScanToken::Structural(byte) => previous = Some(byte),
            ScanToken::Quoted(_) => previous = None,
        }
    }
    false
}

/// The DOT grammar rejects bare tokens like `900s`; wrap duration literals in
/// quotes before handing the source to graphviz.
fn quote_duration_literals(source: &str) -> String {
    let mut rewrites: Vec<(usize, usize)> = Vec::new();
    let mut scanner = SourceScanner::new(source);
    let bytes = source.as_bytes();

    while let Some((at, token)) = scanner.next_token() {
        if token != ScanToken::Structural(b'=') {
            continue;
        }

        let mut start = at + 1;
        while start < bytes.len() && (bytes[start] as char).is_whitespace() {
            start += 1;
        }
        if start >= bytes.len() || bytes[start] == b'"' {
            continue;
        }

        let mut end = start;
        while end < bytes.len() && (bytes[end] as char).is_ascii_alphanumeric() {
            end += 1;
        }
        if end > start && parse_duration(&source[start..end]).is_some() {
            rewrites.push((start, end));
        }
    }

    if rewrites.is_empty() {
        return source.to_string();
    }

    let mut output = String::with_capacity(source.len() + rewrites.len() * 2);
    let mut cursor = 0;
    for (start, end) in rewrites {
        output.push_str(&source[cursor..start]);
        output.push('"');
        output.push_str(&source[start..end]);
        output.push('"');
        cursor = end;
    }
    output.push_str(&source[cursor..]);
    output
}
