/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::collections::{HashMap, HashSet};
use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;

/// Rule id of the start symbol; further rules count down from -2.
pub const START_RULE_ID: i32 = -1;

const NIL: usize = usize::MAX;

#[derive(Error, Debug)]
pub enum GrammarError {
    #[error("grammar blob is truncated")]
    Truncated,
    #[error("grammar references missing rule {0}")]
    MissingRule(i32),
}

/// A grammar symbol: terminals are non-negative call-signature ids,
/// non-terminals are (negative) rule ids. `exp` is a run-length
/// exponent, so `val^exp` stands for `exp` repetitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Sym {
    val: i32,
    exp: i32,
}

impl Sym {
    fn is_terminal(&self) -> bool {
        self.val >= 0
    }
}

#[derive(Debug)]
struct Node {
    sym: Sym,
    prev: usize,
    next: usize,
    alive: bool,
    guard: bool,
}

struct Rule {
    guard: usize,
    /// Nodes referencing this rule from other rule bodies.
    occurrences: HashSet<usize>,
}

/// Context-free grammar built online in Sequitur fashion: each rule body
/// is a circular doubly linked symbol list behind a guard node, and a
/// digram index maps each adjacent symbol pair to the node holding its
/// only occurrence.
///
/// Two invariants hold after every append: no two non-overlapping
/// occurrences of the same digram exist anywhere, and every non-start
/// rule is referenced at least twice.
pub struct Grammar {
    nodes: Vec<Node>,
    rules: HashMap<i32, Rule>,
    rule_order: Vec<i32>,
    digrams: HashMap<(Sym, Sym), usize>,
    next_rule_id: i32,
}

impl Grammar {
    pub fn new() -> Self {
        let mut grammar = Grammar {
            nodes: Vec::new(),
            rules: HashMap::new(),
            rule_order: Vec::new(),
            digrams: HashMap::new(),
            next_rule_id: START_RULE_ID - 1,
        };
        let guard = grammar.new_guard(START_RULE_ID);
        grammar.rules.insert(
            START_RULE_ID,
            Rule {
                guard,
                occurrences: HashSet::new(),
            },
        );
        grammar.rule_order.push(START_RULE_ID);
        grammar
    }

    /// Append `repeat` copies of `terminal_id` to the start rule and
    /// restore both grammar invariants.
    pub fn append_terminal(&mut self, terminal_id: i32, repeat: i32) {
        if repeat <= 0 {
            return;
        }
        let guard = self.rules[&START_RULE_ID].guard;
        let last = self.nodes[guard].prev;
        if last != guard && self.nodes[last].sym.is_terminal() && self.nodes[last].sym.val == terminal_id
        {
            // Run-length merge with the tail symbol. The digram formed
            // with its left neighbor changes key, so re-index it.
            let before = self.nodes[last].prev;
            self.unindex(before, last);
            self.nodes[last].sym.exp += repeat;
            if before != guard {
                self.check_digram(before);
            }
            return;
        }
        let node = self.new_node(Sym {
            val: terminal_id,
            exp: repeat,
        });
        self.link_before(guard, node);
        let prev = self.nodes[node].prev;
        if prev != guard {
            self.check_digram(prev);
        }
    }

    /// Flat serialized form: rule count, then per rule its id, its
    /// symbol count, and one `(value, exponent)` pair per symbol.
    pub fn to_flat(&self) -> Vec<i32> {
        let live: Vec<i32> = self
            .rule_order
            .iter()
            .copied()
            .filter(|id| self.rules.contains_key(id))
            .collect();
        let mut flat = vec![live.len() as i32];
        for rule_id in live {
            let mut symbols = Vec::new();
            let guard = self.rules[&rule_id].guard;
            let mut node = self.nodes[guard].next;
            while node != guard {
                symbols.push(self.nodes[node].sym);
                node = self.nodes[node].next;
            }
            flat.push(rule_id);
            flat.push(symbols.len() as i32);
            for sym in symbols {
                flat.push(sym.val);
                flat.push(sym.exp);
            }
        }
        flat
    }

    pub fn serialize(&self) -> Vec<u8> {
        let flat = self.to_flat();
        let mut bytes = Vec::with_capacity(flat.len() * 4);
        for value in flat {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bytes
    }

    // ---- node and list plumbing -----------------------------------

    fn new_node(&mut self, sym: Sym) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node {
            sym,
            prev: NIL,
            next: NIL,
            alive: true,
            guard: false,
        });
        id
    }

    fn new_guard(&mut self, rule_id: i32) -> usize {
        let id = self.nodes.len();
        self.nodes.push(Node {
            sym: Sym {
                val: rule_id,
                exp: 0,
            },
            prev: id,
            next: id,
            alive: true,
            guard: true,
        });
        id
    }

    fn link_before(&mut self, at: usize, node: usize) {
        let prev = self.nodes[at].prev;
        self.nodes[node].prev = prev;
        self.nodes[node].next = at;
        self.nodes[prev].next = node;
        self.nodes[at].prev = node;
    }

    fn unlink(&mut self, node: usize) {
        let prev = self.nodes[node].prev;
        let next = self.nodes[node].next;
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[node].alive = false;
        if !self.nodes[node].sym.is_terminal() && !self.nodes[node].guard {
            let rule_id = self.nodes[node].sym.val;
            if let Some(rule) = self.rules.get_mut(&rule_id) {
                rule.occurrences.remove(&node);
            }
        }
    }

    fn digram_key(&self, first: usize) -> (Sym, Sym) {
        let second = self.nodes[first].next;
        (self.nodes[first].sym, self.nodes[second].sym)
    }

    /// Drop the index entry for the digram starting at `first`, if that
    /// exact occurrence is the indexed one.
    fn unindex(&mut self, first: usize, second: usize) {
        if first == NIL || self.nodes[first].guard || self.nodes[second].guard {
            return;
        }
        let key = (self.nodes[first].sym, self.nodes[second].sym);
        if self.digrams.get(&key) == Some(&first) {
            self.digrams.remove(&key);
        }
    }

    // ---- invariant enforcement ------------------------------------

    /// Examine the digram starting at `first`; factor it out when it
    /// already occurs elsewhere.
    fn check_digram(&mut self, first: usize) {
        if !self.nodes[first].alive || self.nodes[first].guard {
            return;
        }
        let second = self.nodes[first].next;
        if self.nodes[second].guard {
            return;
        }
        let key = self.digram_key(first);
        match self.digrams.get(&key).copied() {
            None => {
                self.digrams.insert(key, first);
            }
            Some(existing) => {
                if existing == first {
                    return;
                }
                // Re-point stale entries instead of matching on them.
                if !self.nodes[existing].alive
                    || self.nodes[self.nodes[existing].next].guard
                    || self.digram_key(existing) != key
                {
                    self.digrams.insert(key, first);
                    return;
                }
                // Overlapping occurrences (e.g. x x x) never match.
                if self.nodes[existing].next == first || self.nodes[first].next == existing {
                    return;
                }
                self.resolve_match(first, existing);
            }
        }
    }

    fn is_full_rule_body(&self, first: usize) -> bool {
        let prev = self.nodes[first].prev;
        let second = self.nodes[first].next;
        self.nodes[prev].guard && self.nodes[self.nodes[second].next].guard
    }

    fn rule_of_guard(&self, guard: usize) -> i32 {
        self.nodes[guard].sym.val
    }

    fn resolve_match(&mut self, new_first: usize, existing_first: usize) {
        if self.is_full_rule_body(existing_first) {
            // The other occurrence is exactly some rule's body: reuse it.
            let rule_id = self.rule_of_guard(self.nodes[existing_first].prev);
            self.substitute(new_first, rule_id);
        } else {
            let key = self.digram_key(existing_first);
            let rule_id = self.create_rule(key.0, key.1);
            self.substitute(existing_first, rule_id);
            // The cascade from the first substitution may have consumed
            // the newer occurrence already.
            if self.nodes[new_first].alive
                && !self.nodes[self.nodes[new_first].next].guard
                && self.digram_key(new_first) == key
            {
                self.substitute(new_first, rule_id);
            }
        }
    }

    fn create_rule(&mut self, a: Sym, b: Sym) -> i32 {
        let rule_id = self.next_rule_id;
        self.next_rule_id -= 1;
        let guard = self.new_guard(rule_id);
        self.rules.insert(
            rule_id,
            Rule {
                guard,
                occurrences: HashSet::new(),
            },
        );
        self.rule_order.push(rule_id);
        for sym in [a, b] {
            let node = self.new_node(sym);
            self.link_before(guard, node);
            if !sym.is_terminal() {
                if let Some(rule) = self.rules.get_mut(&sym.val) {
                    rule.occurrences.insert(node);
                }
            }
        }
        // The body is the canonical occurrence of this digram.
        self.digrams.insert((a, b), self.nodes[guard].next);
        rule_id
    }

    /// Replace the digram starting at `first` with a reference to
    /// `rule_id`, then re-check the disturbed digrams and the utility of
    /// any rule that lost a reference.
    fn substitute(&mut self, first: usize, rule_id: i32) {
        let second = self.nodes[first].next;
        let prev = self.nodes[first].prev;
        let after = self.nodes[second].next;

        if !self.nodes[prev].guard {
            self.unindex(prev, first);
        }
        self.unindex(first, second);
        if !self.nodes[after].guard {
            self.unindex(second, after);
        }

        let mut weakened = Vec::new();
        for node in [first, second] {
            let sym = self.nodes[node].sym;
            if !sym.is_terminal() {
                weakened.push(sym.val);
            }
        }
        self.unlink(first);
        self.unlink(second);

        let node = self.new_node(Sym {
            val: rule_id,
            exp: 1,
        });
        self.link_before(after, node);
        if let Some(rule) = self.rules.get_mut(&rule_id) {
            rule.occurrences.insert(node);
        }

        if !self.nodes[prev].guard {
            self.check_digram(prev);
        }
        if self.nodes[node].alive && !self.nodes[self.nodes[node].next].guard {
            self.check_digram(node);
        }

        for rule_id in weakened {
            self.enforce_utility(rule_id);
        }
    }

    /// A rule referenced only once is inlined at its single use and
    /// deleted.
    fn enforce_utility(&mut self, rule_id: i32) {
        let Some(rule) = self.rules.get(&rule_id) else {
            return;
        };
        if rule.occurrences.len() != 1 {
            return;
        }
        let occurrence = *rule.occurrences.iter().next().expect("checked above");
        if !self.nodes[occurrence].alive {
            return;
        }

        let rule = self.rules.remove(&rule_id).expect("checked above");
        let guard = rule.guard;
        let body_first = self.nodes[guard].next;
        let body_last = self.nodes[guard].prev;

        let prev = self.nodes[occurrence].prev;
        let after = self.nodes[occurrence].next;
        if !self.nodes[prev].guard {
            self.unindex(prev, occurrence);
        }
        if !self.nodes[after].guard {
            self.unindex(occurrence, after);
        }
        self.unlink(occurrence);

        // Splice the body between prev and after; interior digram index
        // entries stay valid because the nodes move as a block.
        self.nodes[prev].next = body_first;
        self.nodes[body_first].prev = prev;
        self.nodes[body_last].next = after;
        self.nodes[after].prev = body_last;
        self.nodes[guard].alive = false;

        if !self.nodes[prev].guard {
            self.check_digram(prev);
        }
        if !self.nodes[after].guard && self.nodes[body_last].alive {
            self.check_digram(body_last);
        }
    }

    // ---- test support ---------------------------------------------

    #[cfg(test)]
    fn expand(&self) -> Vec<i32> {
        let mut out = Vec::new();
        self.expand_rule(START_RULE_ID, &mut out);
        out
    }

    #[cfg(test)]
    fn expand_rule(&self, rule_id: i32, out: &mut Vec<i32>) {
        let guard = self.rules[&rule_id].guard;
        let mut node = self.nodes[guard].next;
        while node != guard {
            let sym = self.nodes[node].sym;
            for _ in 0..sym.exp {
                if sym.is_terminal() {
                    out.push(sym.val);
                } else {
                    self.expand_rule(sym.val, out);
                }
            }
            node = self.nodes[node].next;
        }
    }

    #[cfg(test)]
    fn assert_invariants(&self) {
        use std::collections::hash_map::Entry;
        // Digram uniqueness: at most one non-overlapping occurrence of
        // every adjacent pair, across all rules.
        let mut seen: HashMap<(Sym, Sym), usize> = HashMap::new();
        for rule in self.rules.values() {
            let guard = rule.guard;
            let mut node = self.nodes[guard].next;
            while node != guard {
                let next = self.nodes[node].next;
                if next != guard {
                    let key = (self.nodes[node].sym, self.nodes[next].sym);
                    match seen.entry(key) {
                        Entry::Vacant(entry) => {
                            entry.insert(node);
                        }
                        Entry::Occupied(entry) => {
                            let other = *entry.get();
                            let overlapping = self.nodes[other].next == node
                                || self.nodes[node].next == other;
                            assert!(
                                overlapping,
                                "digram {:?} occurs twice without overlap",
                                key
                            );
                        }
                    }
                }
                node = next;
            }
        }
        // Rule utility: every non-start rule is referenced at least
        // twice, and the recorded occurrences are the real ones.
        for (rule_id, rule) in &self.rules {
            if *rule_id == START_RULE_ID {
                continue;
            }
            assert!(
                rule.occurrences.len() >= 2,
                "rule {} referenced {} time(s)",
                rule_id,
                rule.occurrences.len()
            );
            for occurrence in &rule.occurrences {
                assert!(self.nodes[*occurrence].alive);
                assert_eq!(self.nodes[*occurrence].sym.val, *rule_id);
            }
        }
    }
}

impl Default for Grammar {
    fn default() -> Self {
        Grammar::new()
    }
}

/// Parsed form of a serialized grammar, as read back from a trace.
#[derive(Debug, Clone, PartialEq)]
pub struct CfgRules {
    rules: HashMap<i32, Vec<(i32, i32)>>,
}

impl CfgRules {
    pub fn parse(bytes: &[u8]) -> Result<CfgRules, GrammarError> {
        let mut cursor = Cursor::new(bytes);
        let mut read = || cursor.read_i32::<LittleEndian>().map_err(|_| GrammarError::Truncated);
        let rule_count = read()?;
        let mut rules = HashMap::new();
        for _ in 0..rule_count {
            let rule_id = read()?;
            let symbol_count = read()?;
            let mut body = Vec::with_capacity(symbol_count.max(0) as usize);
            for _ in 0..symbol_count {
                let val = read()?;
                let exp = read()?;
                body.push((val, exp));
            }
            rules.insert(rule_id, body);
        }
        Ok(CfgRules { rules })
    }

    /// Recursive rule application from the start rule, visiting each
    /// terminal in sequence order.
    pub fn expand<F: FnMut(i32)>(&self, visit: &mut F) -> Result<(), GrammarError> {
        self.expand_rule(START_RULE_ID, visit)
    }

    fn expand_rule<F: FnMut(i32)>(&self, rule_id: i32, visit: &mut F) -> Result<(), GrammarError> {
        let body = self
            .rules
            .get(&rule_id)
            .ok_or(GrammarError::MissingRule(rule_id))?;
        for (val, exp) in body {
            for _ in 0..*exp {
                if *val >= 0 {
                    visit(*val);
                } else {
                    self.expand_rule(*val, visit)?;
                }
            }
        }
        Ok(())
    }
}
