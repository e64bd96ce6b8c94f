//! SMT-LIB 2 serialization of queries
//!
//! One rendering serves three consumers: the cache daemon key, the
//! backend process input, and the constraint log. Every expression is
//! rendered as a bitvector (comparisons wrap in `ite` to come back to
//! `(_ BitVec 1)`); constraints assert equality with `#b1`, the goal is
//! asserted negated, so a `sat` answer is a counterexample.

use rustc_hash::FxHashMap;

use crate::expr::{ArrayId, ExprData, ExprId, ExprStore};
use crate::query::Query;

/// Renders queries to SMT-LIB 2 text.
///
/// Subterms referenced more than once become `define-fun` auxiliaries
/// so the output stays linear in the DAG size. The memo tables are per
/// query and reset on every call to [`SmtLibPrinter::render`].
pub struct SmtLibPrinter<'a> {
    store: &'a ExprStore,
    refs: FxHashMap<ExprId, usize>,
    names: FxHashMap<ExprId, String>,
    defs: String,
    counter: usize,
}

impl<'a> SmtLibPrinter<'a> {
    pub fn new(store: &'a ExprStore) -> Self {
        Self {
            store,
            refs: FxHashMap::default(),
            names: FxHashMap::default(),
            defs: String::new(),
            counter: 0,
        }
    }

    /// Render `query` as a complete SMT-LIB 2 problem: logic, array
    /// declarations, concrete-array contents, one assert per
    /// constraint, and the negated goal.
    pub fn render(&mut self, query: &Query) -> String {
        self.refs.clear();
        self.names.clear();
        self.defs.clear();
        self.counter = 0;

        let mut roots: Vec<ExprId> = query.constraints.iter().collect();
        roots.push(query.goal);
        self.count_refs(&roots);

        let mut decls = String::new();
        for array in referenced_arrays(self.store, &roots) {
            let info = self.store.array_info(array);
            decls.push_str(&format!(
                "(declare-fun |{}| () (Array (_ BitVec 32) (_ BitVec 8)))\n",
                info.name
            ));
            if let Some(values) = &info.constant_values {
                for (offset, byte) in values.iter().enumerate() {
                    decls.push_str(&format!(
                        "(assert (= (select |{}| (_ bv{} 32)) (_ bv{} 8)))\n",
                        info.name, offset, byte
                    ));
                }
            }
        }

        let mut asserts = String::new();
        for c in query.constraints.iter() {
            let rendered = self.atom(c);
            asserts.push_str(&format!("(assert (= {rendered} #b1))\n"));
        }
        let goal = self.atom(query.goal);
        asserts.push_str(&format!("(assert (= {goal} #b0))\n"));

        format!("(set-logic QF_ABV)\n{decls}{}{asserts}", self.defs)
    }

    fn count_refs(&mut self, roots: &[ExprId]) {
        let mut stack: Vec<ExprId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            let count = self.refs.entry(id).or_insert(0);
            *count += 1;
            if *count == 1 {
                stack.extend(self.store.data(id).children());
            }
        }
    }

    /// Rendered form of `id`, as an auxiliary name if the node is
    /// shared. Children render before the parent definition is
    /// appended, so definitions come out in dependency order.
    fn atom(&mut self, id: ExprId) -> String {
        if let Some(name) = self.names.get(&id) {
            return name.clone();
        }
        let data = self.store.data(id);
        let rendered = self.render_node(&data);
        let shared = self.refs.get(&id).copied().unwrap_or(0) > 1;
        if shared && !matches!(data, ExprData::Constant { .. }) {
            let name = format!("aux{}", self.counter);
            self.counter += 1;
            self.defs.push_str(&format!(
                "(define-fun {name} () (_ BitVec {}) {rendered})\n",
                self.store.width(id)
            ));
            self.names.insert(id, name.clone());
            name
        } else {
            rendered
        }
    }

    fn render_node(&mut self, data: &ExprData) -> String {
        match data {
            ExprData::Constant { value, width } => format!("(_ bv{value} {width})"),
            ExprData::Read {
                root,
                index,
                updates,
            } => {
                let mut base = format!("|{}|", self.store.array_info(*root).name);
                // oldest write first so the newest ends up outermost
                for (ui, uv) in updates.iter().rev() {
                    let ui = self.atom(*ui);
                    let uv = self.atom(*uv);
                    base = format!("(store {base} {ui} {uv})");
                }
                let index = self.atom(*index);
                format!("(select {base} {index})")
            }
            ExprData::Ite { cond, then, els } => {
                let cond = self.atom(*cond);
                let then = self.atom(*then);
                let els = self.atom(*els);
                format!("(ite (= {cond} #b1) {then} {els})")
            }
            ExprData::Concat { msb, lsb } => {
                let msb = self.atom(*msb);
                let lsb = self.atom(*lsb);
                format!("(concat {msb} {lsb})")
            }
            ExprData::Extract {
                expr,
                offset,
                width,
            } => {
                let hi = offset + width - 1;
                let expr = self.atom(*expr);
                format!("((_ extract {hi} {offset}) {expr})")
            }
            ExprData::ZExt { expr, width } => {
                let extra = width - self.store.width(*expr);
                let expr = self.atom(*expr);
                format!("((_ zero_extend {extra}) {expr})")
            }
            ExprData::SExt { expr, width } => {
                let extra = width - self.store.width(*expr);
                let expr = self.atom(*expr);
                format!("((_ sign_extend {extra}) {expr})")
            }
            ExprData::Not(e) => format!("(bvnot {})", self.atom(*e)),
            ExprData::And(a, b) => self.binop("bvand", *a, *b),
            ExprData::Or(a, b) => self.binop("bvor", *a, *b),
            ExprData::Xor(a, b) => self.binop("bvxor", *a, *b),
            ExprData::Add(a, b) => self.binop("bvadd", *a, *b),
            ExprData::Sub(a, b) => self.binop("bvsub", *a, *b),
            ExprData::Mul(a, b) => self.binop("bvmul", *a, *b),
            ExprData::UDiv(a, b) => self.binop("bvudiv", *a, *b),
            ExprData::SDiv(a, b) => self.binop("bvsdiv", *a, *b),
            ExprData::URem(a, b) => self.binop("bvurem", *a, *b),
            ExprData::SRem(a, b) => self.binop("bvsrem", *a, *b),
            ExprData::Shl(a, b) => self.binop("bvshl", *a, *b),
            ExprData::LShr(a, b) => self.binop("bvlshr", *a, *b),
            ExprData::AShr(a, b) => self.binop("bvashr", *a, *b),
            ExprData::Eq(a, b) => self.predicate("=", *a, *b),
            ExprData::Ult(a, b) => self.predicate("bvult", *a, *b),
            ExprData::Ule(a, b) => self.predicate("bvule", *a, *b),
            ExprData::Slt(a, b) => self.predicate("bvslt", *a, *b),
            ExprData::Sle(a, b) => self.predicate("bvsle", *a, *b),
        }
    }

    fn binop(&mut self, op: &str, a: ExprId, b: ExprId) -> String {
        let a = self.atom(a);
        let b = self.atom(b);
        format!("({op} {a} {b})")
    }

    fn predicate(&mut self, op: &str, a: ExprId, b: ExprId) -> String {
        let a = self.atom(a);
        let b = self.atom(b);
        format!("(ite ({op} {a} {b}) #b1 #b0)")
    }
}

/// All arrays read by `roots` (concrete ones included), in first-visit
/// order.
fn referenced_arrays(store: &ExprStore, roots: &[ExprId]) -> Vec<ArrayId> {
    let mut seen = rustc_hash::FxHashSet::default();
    let mut out = Vec::new();
    crate::expr::for_each_node(store, roots, |id| {
        if let ExprData::Read { root, .. } = store.data(id) {
            if seen.insert(root) {
                out.push(root);
            }
        }
    });
    out
}

/// One-shot rendering of `query`.
pub fn render_query(store: &ExprStore, query: &Query) -> String {
    SmtLibPrinter::new(store).render(query)
}
