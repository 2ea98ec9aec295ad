// The changes suggested by this lint usually make the code more cluttered and less clear:
#![allow(clippy::needless_range_loop)]

pub mod expression;

use anyhow::{bail, ensure, Context, Result};
use hashbrown::{HashMap, HashSet};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::hash::Hash;
use std::path::Path;
use std::str::FromStr;
use strum_macros::{EnumString, IntoStaticStr, VariantNames};

pub use expression::{Dnf, LabelSet};
use expression::{parse_expression, DefinitionTable};

#[derive(Default, Clone, Debug)]
pub struct IndexedVec<T: Hash + Eq> {
    pub keys: Vec<T>,
    pub index_by_key: HashMap<T, usize>,
}

impl<T: Hash + Eq> IndexedVec<T> {
    pub fn add<U: ToOwned<Owned = T> + ?Sized>(&mut self, name: &U) -> usize {
        if !self.index_by_key.contains_key(&name.to_owned()) {
            let idx = self.keys.len();
            self.index_by_key.insert(name.to_owned(), self.keys.len());
            self.keys.push(name.to_owned());
            idx
        } else {
            self.index_by_key[&name.to_owned()]
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Shape of a logic-file edge line, determined by its operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EdgeKind {
    /// `A>B`
    OneWay,
    /// `A=B`
    Symmetric,
    /// `A=>B`: both directions, and B may only be entered from A.
    ReturnBridge,
    /// `A>>B`: one way, and A is required before B.
    RequiredOneWay,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EdgeDecl {
    pub source: String,
    pub destination: String,
    pub kind: EdgeKind,
    pub condition: Dnf,
    pub line: usize,
}

/// Directive names accepted after a leading `.` in the logic file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, EnumString, VariantNames, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum Directive {
    Start,
    Goal,
    Def,
    Require,
    Guarantee,
    Missable,
    Bridge,
    Orphanless,
    Tag,
    Unreachable,
    Nongoal,
    ReachableFromWithout,
    Dependency,
    FullGuarantee,
    Or,
    And,
}

/// Label-level requirement declaration, resolved to node ids by the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequirementDecl {
    Require {
        node: String,
        set: LabelSet,
    },
    Guarantee {
        node: String,
        set: LabelSet,
    },
    Missable {
        node: String,
        set: LabelSet,
    },
    Bridge {
        node: String,
        set: LabelSet,
    },
    Orphanless {
        node: String,
    },
    Tag {
        node: String,
        tags: LabelSet,
    },
    Unreachable {
        targets: LabelSet,
    },
    Nongoal {
        targets: LabelSet,
    },
    ReachableFromWithout {
        node: String,
        from: String,
        avoid: LabelSet,
    },
    Dependency {
        node: String,
        set: LabelSet,
    },
    FullGuarantee {
        node: String,
        alternatives: Dnf,
    },
    ComplexOr(Vec<RequirementDecl>),
    ComplexAnd(Vec<RequirementDecl>),
}

impl RequirementDecl {
    /// Every label mentioned by the declaration, including nested children.
    pub fn labels(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_labels(&mut out);
        out
    }

    fn collect_labels<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            RequirementDecl::Require { node, set }
            | RequirementDecl::Guarantee { node, set }
            | RequirementDecl::Missable { node, set }
            | RequirementDecl::Bridge { node, set }
            | RequirementDecl::Dependency { node, set } => {
                out.insert(node);
                out.extend(set.iter().map(|x| x.as_str()));
            }
            RequirementDecl::Orphanless { node } | RequirementDecl::Tag { node, .. } => {
                out.insert(node);
            }
            RequirementDecl::Unreachable { targets } | RequirementDecl::Nongoal { targets } => {
                out.extend(targets.iter().map(|x| x.as_str()));
            }
            RequirementDecl::ReachableFromWithout { node, from, avoid } => {
                out.insert(node);
                out.insert(from);
                out.extend(avoid.iter().map(|x| x.as_str()));
            }
            RequirementDecl::FullGuarantee { node, alternatives } => {
                out.insert(node);
                for alt in alternatives {
                    out.extend(alt.iter().map(|x| x.as_str()));
                }
            }
            RequirementDecl::ComplexOr(children) | RequirementDecl::ComplexAnd(children) => {
                for child in children {
                    child.collect_labels(out);
                }
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CompositeKind {
    Or,
    And,
}

#[derive(Clone, Debug)]
enum ChildDecl {
    Simple(RequirementDecl),
    Composite(String),
}

#[derive(Clone, Debug)]
struct CompositeDecl {
    kind: CompositeKind,
    children: Vec<ChildDecl>,
    line: usize,
}

#[derive(Default, Clone, Debug)]
pub struct LogicData {
    pub nodes: IndexedVec<String>,
    pub connectable: Vec<bool>,
    pub edges: Vec<EdgeDecl>,
    pub requirements: Vec<RequirementDecl>,
    pub start: Option<String>,
    pub goal: Dnf,
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
}

fn split_edge_token(token: &str) -> Option<(&str, &str, EdgeKind)> {
    for (op, kind) in [
        ("=>", EdgeKind::ReturnBridge),
        (">>", EdgeKind::RequiredOneWay),
        (">", EdgeKind::OneWay),
        ("=", EdgeKind::Symmetric),
    ] {
        if let Some(i) = token.find(op) {
            return Some((&token[..i], &token[i + op.len()..], kind));
        }
    }
    None
}

fn label_set(args: &[&str]) -> LabelSet {
    args.iter().map(|x| x.to_string()).collect()
}

/// Builds a simple (non-composite) requirement from its directive and arguments.
fn build_simple_requirement(
    directive: Directive,
    args: &[&str],
    defs: &mut DefinitionTable,
    line: usize,
) -> Result<RequirementDecl> {
    let min_args = match directive {
        Directive::Orphanless | Directive::Unreachable | Directive::Nongoal => 1,
        _ => 2,
    };
    ensure!(
        args.len() >= min_args,
        "line {line}: .{} expects at least {min_args} argument(s)",
        <&'static str>::from(directive)
    );
    let node = args[0].to_string();
    let decl = match directive {
        Directive::Require => RequirementDecl::Require {
            node,
            set: label_set(&args[1..]),
        },
        Directive::Guarantee => RequirementDecl::Guarantee {
            node,
            set: label_set(&args[1..]),
        },
        Directive::Missable => RequirementDecl::Missable {
            node,
            set: label_set(&args[1..]),
        },
        Directive::Bridge => RequirementDecl::Bridge {
            node,
            set: label_set(&args[1..]),
        },
        Directive::Orphanless => {
            ensure!(args.len() == 1, "line {line}: .orphanless takes one node");
            RequirementDecl::Orphanless { node }
        }
        Directive::Tag => RequirementDecl::Tag {
            node,
            tags: label_set(&args[1..]),
        },
        Directive::Unreachable => RequirementDecl::Unreachable {
            targets: label_set(args),
        },
        Directive::Nongoal => RequirementDecl::Nongoal {
            targets: label_set(args),
        },
        Directive::ReachableFromWithout => RequirementDecl::ReachableFromWithout {
            node,
            from: args[1].to_string(),
            avoid: label_set(&args[2..]),
        },
        Directive::Dependency => RequirementDecl::Dependency {
            node,
            set: label_set(&args[1..]),
        },
        Directive::FullGuarantee => {
            let mut alternatives: Dnf = vec![];
            for expr in &args[1..] {
                alternatives.extend(parse_expression(expr, defs)?);
            }
            RequirementDecl::FullGuarantee {
                node,
                alternatives: expression::simplify(alternatives),
            }
        }
        Directive::Start
        | Directive::Goal
        | Directive::Def
        | Directive::Or
        | Directive::And => {
            bail!(
                "line {line}: .{} cannot be used as a requirement",
                <&'static str>::from(directive)
            )
        }
    };
    Ok(decl)
}

fn parse_directive_name(token: &str, line: usize) -> Result<Directive> {
    let name = token
        .strip_prefix('.')
        .with_context(|| format!("line {line}: expected a directive, found {token}"))?;
    Directive::from_str(name).with_context(|| format!("line {line}: unknown directive .{name}"))
}

struct CompositeTable {
    names: IndexedVec<String>,
    decls: Vec<CompositeDecl>,
}

impl CompositeTable {
    fn get_or_create(&mut self, name: &str, kind: CompositeKind, line: usize) -> Result<usize> {
        if let Some(&idx) = self.names.index_by_key.get(name) {
            ensure!(
                self.decls[idx].kind == kind,
                "line {line}: composite {name} was declared with a different kind on line {}",
                self.decls[idx].line
            );
            return Ok(idx);
        }
        let idx = self.names.add(name);
        self.decls.push(CompositeDecl {
            kind,
            children: vec![],
            line,
        });
        Ok(idx)
    }

    fn resolve(&self, idx: usize, stack: &mut Vec<usize>) -> Result<RequirementDecl> {
        if stack.contains(&idx) {
            bail!(
                "circular composite requirement involving {}",
                self.names.keys[idx]
            );
        }
        stack.push(idx);
        let decl = &self.decls[idx];
        let mut children = vec![];
        for child in &decl.children {
            match child {
                ChildDecl::Simple(r) => children.push(r.clone()),
                ChildDecl::Composite(name) => {
                    let &child_idx = self.names.index_by_key.get(name).with_context(|| {
                        format!(
                            "composite {} references undeclared composite {name}",
                            self.names.keys[idx]
                        )
                    })?;
                    children.push(self.resolve(child_idx, stack)?);
                }
            }
        }
        stack.pop();
        ensure!(
            !children.is_empty(),
            "composite {} (line {}) has no children",
            self.names.keys[idx],
            decl.line
        );
        Ok(match decl.kind {
            CompositeKind::Or => RequirementDecl::ComplexOr(children),
            CompositeKind::And => RequirementDecl::ComplexAnd(children),
        })
    }
}

fn decompose_and(decl: RequirementDecl, out: &mut Vec<RequirementDecl>) {
    match decl {
        RequirementDecl::ComplexAnd(children) => {
            for child in children {
                decompose_and(child, out);
            }
        }
        other => out.push(other),
    }
}

pub fn parse_nodes(text: &str) -> Result<(IndexedVec<String>, Vec<bool>)> {
    let mut nodes: IndexedVec<String> = IndexedVec::default();
    let mut connectable = vec![];
    for (i, raw) in text.lines().enumerate() {
        let line = strip_comment(raw).trim();
        if line.is_empty() {
            continue;
        }
        let (label, is_connectable) = match line.strip_prefix('+') {
            Some(rest) => (rest.trim(), false),
            None => (line, true),
        };
        ensure!(
            !label.is_empty() && !label.contains(char::is_whitespace),
            "node file line {}: invalid label {line:?}",
            i + 1
        );
        ensure!(
            !nodes.index_by_key.contains_key(label),
            "node file line {}: duplicate node {label}",
            i + 1
        );
        nodes.add(label);
        connectable.push(is_connectable);
    }
    Ok((nodes, connectable))
}

impl LogicData {
    pub fn load(nodes_path: &Path, logic_path: &Path) -> Result<LogicData> {
        let nodes_str = std::fs::read_to_string(nodes_path)
            .with_context(|| format!("unable to read {}", nodes_path.display()))?;
        let logic_str = std::fs::read_to_string(logic_path)
            .with_context(|| format!("unable to read {}", logic_path.display()))?;
        let data = LogicData::parse(&nodes_str, &logic_str)
            .with_context(|| format!("unable to parse {}", logic_path.display()))?;
        info!(
            "Loaded {} nodes, {} edge declarations, {} requirements",
            data.nodes.len(),
            data.edges.len(),
            data.requirements.len()
        );
        Ok(data)
    }

    pub fn parse(nodes_text: &str, logic_text: &str) -> Result<LogicData> {
        let (nodes, connectable) = parse_nodes(nodes_text)?;
        let mut data = LogicData {
            nodes,
            connectable,
            ..LogicData::default()
        };

        // Definitions may be used before they appear, so collect them first.
        let mut defs = DefinitionTable::default();
        let mut lines: Vec<(usize, &str)> = vec![];
        for (i, raw) in logic_text.lines().enumerate() {
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }
            if let Some(rest) = line.strip_prefix(".def") {
                if rest.starts_with(char::is_whitespace) {
                    let tokens: Vec<&str> = rest.split_whitespace().collect();
                    ensure!(
                        tokens.len() >= 2,
                        "line {}: .def expects a name and an expression",
                        i + 1
                    );
                    defs.declare(tokens[0], &tokens[1..].join(""), i + 1)?;
                    continue;
                }
            }
            lines.push((i + 1, line));
        }
        defs.expand_all()?;

        let mut composites = CompositeTable {
            names: IndexedVec::default(),
            decls: vec![],
        };
        let mut referenced: HashSet<String> = HashSet::new();
        for (line_num, line) in lines {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if let Some(name) = tokens[0].strip_prefix('+') {
                let &idx = composites.names.index_by_key.get(name).with_context(|| {
                    format!("line {line_num}: +{name} appends to an undeclared composite")
                })?;
                ensure!(
                    tokens.len() > 1,
                    "line {line_num}: +{name} needs a requirement to append"
                );
                let child =
                    Self::parse_child(&tokens[1..], &mut defs, &mut referenced, line_num)?;
                composites.decls[idx].children.push(child);
            } else if tokens[0].starts_with('.') {
                let directive = parse_directive_name(tokens[0], line_num)?;
                match directive {
                    Directive::Start => {
                        ensure!(tokens.len() == 2, "line {line_num}: .start takes one label");
                        ensure!(
                            data.start.is_none(),
                            "line {line_num}: start node declared twice"
                        );
                        data.start = Some(tokens[1].to_string());
                    }
                    Directive::Goal => {
                        ensure!(tokens.len() >= 2, "line {line_num}: .goal needs an expression");
                        data.goal
                            .extend(parse_expression(&tokens[1..].join(""), &mut defs)?);
                    }
                    Directive::Or | Directive::And => {
                        ensure!(
                            tokens.len() >= 2,
                            "line {line_num}: composite directive needs a name"
                        );
                        let kind = if directive == Directive::Or {
                            CompositeKind::Or
                        } else {
                            CompositeKind::And
                        };
                        let idx = composites.get_or_create(tokens[1], kind, line_num)?;
                        if tokens.len() > 2 {
                            let child = Self::parse_child(
                                &tokens[2..],
                                &mut defs,
                                &mut referenced,
                                line_num,
                            )?;
                            composites.decls[idx].children.push(child);
                        }
                    }
                    Directive::Def => {
                        bail!("line {line_num}: .def expects a name and an expression")
                    }
                    _ => {
                        data.requirements.push(build_simple_requirement(
                            directive,
                            &tokens[1..],
                            &mut defs,
                            line_num,
                        )?);
                    }
                }
            } else {
                data.parse_edge_line(&tokens, &mut defs, line_num)?;
            }
        }
        data.goal = expression::simplify(std::mem::take(&mut data.goal));

        for idx in 0..composites.decls.len() {
            let name = &composites.names.keys[idx];
            if referenced.contains(name) {
                continue;
            }
            let decl = composites.resolve(idx, &mut vec![])?;
            match decl {
                RequirementDecl::ComplexAnd(_) => decompose_and(decl, &mut data.requirements),
                other => data.requirements.push(other),
            }
        }
        data.check_dependency_cycles()?;
        Ok(data)
    }

    fn parse_child(
        tokens: &[&str],
        defs: &mut DefinitionTable,
        referenced: &mut HashSet<String>,
        line: usize,
    ) -> Result<ChildDecl> {
        let directive = parse_directive_name(tokens[0], line)?;
        match directive {
            Directive::Or | Directive::And => {
                ensure!(
                    tokens.len() == 2,
                    "line {line}: nested composites are referenced by name only"
                );
                referenced.insert(tokens[1].to_string());
                Ok(ChildDecl::Composite(tokens[1].to_string()))
            }
            _ => Ok(ChildDecl::Simple(build_simple_requirement(
                directive,
                &tokens[1..],
                defs,
                line,
            )?)),
        }
    }

    fn parse_edge_line(
        &mut self,
        tokens: &[&str],
        defs: &mut DefinitionTable,
        line: usize,
    ) -> Result<()> {
        let (source, destination, kind) = split_edge_token(tokens[0])
            .with_context(|| format!("line {line}: unrecognized line {:?}", tokens[0]))?;
        ensure!(
            !source.is_empty() && !destination.is_empty(),
            "line {line}: edge is missing an endpoint"
        );
        let condition = if tokens.len() > 1 {
            parse_expression(&tokens[1..].join(""), defs)?
        } else {
            vec![LabelSet::new()]
        };
        if source == destination {
            // Self-pairing names a compatibility tag instead of an edge.
            ensure!(
                kind == EdgeKind::Symmetric,
                "line {line}: {source} cannot lead to itself"
            );
            self.requirements.push(RequirementDecl::Tag {
                node: source.to_string(),
                tags: [source.to_string()].into_iter().collect(),
            });
            return Ok(());
        }
        self.edges.push(EdgeDecl {
            source: source.to_string(),
            destination: destination.to_string(),
            kind,
            condition,
            line,
        });
        Ok(())
    }

    fn check_dependency_cycles(&self) -> Result<()> {
        let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
        for req in &self.requirements {
            if let RequirementDecl::Dependency { node, set } = req {
                deps.entry(node.as_str())
                    .or_default()
                    .extend(set.iter().map(|x| x.as_str()));
            }
        }
        // 0 = unvisited, 1 = on stack, 2 = done
        let mut state: HashMap<&str, u8> = HashMap::new();
        fn visit<'a>(
            node: &'a str,
            deps: &HashMap<&'a str, Vec<&'a str>>,
            state: &mut HashMap<&'a str, u8>,
        ) -> Result<()> {
            match state.get(node) {
                Some(1) => bail!("circular dependency involving {node}"),
                Some(2) => return Ok(()),
                _ => {}
            }
            state.insert(node, 1);
            if let Some(next) = deps.get(node) {
                for &n in next {
                    visit(n, deps, state)?;
                }
            }
            state.insert(node, 2);
            Ok(())
        }
        let mut roots: Vec<&str> = deps.keys().copied().collect();
        roots.sort();
        for node in roots {
            visit(node, &deps, &mut state)?;
        }
        Ok(())
    }
}
