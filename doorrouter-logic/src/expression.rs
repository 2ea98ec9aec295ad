//! Condition expressions: `|` separates alternatives, `&` joins terms, and a
//! term is either a node label or a `.def` name.

use anyhow::{bail, ensure, Result};
use hashbrown::HashMap;
use std::collections::BTreeSet;

pub type LabelSet = BTreeSet<String>;

/// Disjunctive normal form: any one of the label sets suffices.
pub type Dnf = Vec<LabelSet>;

/// Removes duplicate alternatives and those implied by a smaller one, then
/// orders the rest by size.
pub fn simplify(mut dnf: Dnf) -> Dnf {
    dnf.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    dnf.dedup();
    let mut out: Dnf = vec![];
    for alt in dnf {
        if !out.iter().any(|kept| kept.is_subset(&alt)) {
            out.push(alt);
        }
    }
    out
}

fn conjoin(left: &Dnf, right: &Dnf) -> Dnf {
    let mut out = vec![];
    for a in left {
        for b in right {
            out.push(a.union(b).cloned().collect());
        }
    }
    out
}

#[derive(Default, Debug)]
pub struct DefinitionTable {
    raw: HashMap<String, (String, usize)>,
    expanded: HashMap<String, Dnf>,
}

impl DefinitionTable {
    pub fn declare(&mut self, name: &str, expr: &str, line: usize) -> Result<()> {
        if let Some((_, prev)) = self.raw.get(name) {
            bail!("line {line}: {name} was already defined on line {prev}");
        }
        self.raw.insert(name.to_string(), (expr.to_string(), line));
        Ok(())
    }

    pub fn expand_all(&mut self) -> Result<()> {
        let mut names: Vec<String> = self.raw.keys().cloned().collect();
        names.sort();
        for name in names {
            self.resolve(&name, &mut vec![])?;
        }
        Ok(())
    }

    pub fn is_defined(&self, name: &str) -> bool {
        self.raw.contains_key(name)
    }

    fn resolve(&mut self, name: &str, stack: &mut Vec<String>) -> Result<Dnf> {
        if let Some(dnf) = self.expanded.get(name) {
            return Ok(dnf.clone());
        }
        if stack.iter().any(|x| x == name) {
            bail!("circular definition: {} > {name}", stack.join(" > "));
        }
        let Some((expr, _)) = self.raw.get(name).cloned() else {
            bail!("{name} is not defined");
        };
        stack.push(name.to_string());
        let dnf = self.parse(&expr, stack)?;
        stack.pop();
        self.expanded.insert(name.to_string(), dnf.clone());
        Ok(dnf)
    }

    fn parse(&mut self, expr: &str, stack: &mut Vec<String>) -> Result<Dnf> {
        let mut out: Dnf = vec![];
        for disjunct in expr.split('|') {
            let mut acc: Dnf = vec![LabelSet::new()];
            for term in disjunct.split('&') {
                let term = term.trim();
                ensure!(!term.is_empty(), "empty term in expression {expr:?}");
                let term_dnf = if self.is_defined(term) {
                    self.resolve(term, stack)?
                } else {
                    vec![[term.to_string()].into_iter().collect()]
                };
                acc = conjoin(&acc, &term_dnf);
            }
            out.extend(acc);
        }
        Ok(simplify(out))
    }
}

pub fn parse_expression(expr: &str, defs: &mut DefinitionTable) -> Result<Dnf> {
    defs.parse(expr, &mut vec![])
}
