//! Hash-consed expression DAG
//!
//! Expressions live in an [`ExprStore`] arena and are referenced by
//! [`ExprId`] handles. Interning guarantees that structurally identical
//! expressions share a single node, so id equality is structural
//! equality and constraint sets stay cheap to hash and compare.

use std::cell::RefCell;
use std::cmp::Ordering;

use num_bigint::BigUint;
use num_traits::{One, Zero};
use rustc_hash::FxHashMap;

/// Bit width of an expression. Width 1 doubles as boolean.
pub type Width = u32;

/// Handle to an interned expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(u32);

impl ExprId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a registered array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArrayId(u32);

impl ArrayId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// A byte array backing `Read` expressions.
///
/// Arrays are registered once per name. A symbolic array has no
/// `constant_values`; a concrete one carries one byte per cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Array {
    pub name: String,
    pub size: u32,
    pub constant_values: Option<Vec<u8>>,
}

impl Array {
    pub fn is_symbolic(&self) -> bool {
        self.constant_values.is_none()
    }
}

/// Expression node payload.
///
/// Binary bitvector operations take equal-width operands. Comparison
/// operators produce width 1. `Read` indexes are 32-bit; `updates` is a
/// newest-first list of `(index, value)` write pairs layered over the
/// root array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExprData {
    Constant {
        value: BigUint,
        width: Width,
    },
    Read {
        root: ArrayId,
        index: ExprId,
        updates: Vec<(ExprId, ExprId)>,
    },
    Ite {
        cond: ExprId,
        then: ExprId,
        els: ExprId,
    },
    Concat {
        msb: ExprId,
        lsb: ExprId,
    },
    Extract {
        expr: ExprId,
        offset: u32,
        width: Width,
    },
    ZExt {
        expr: ExprId,
        width: Width,
    },
    SExt {
        expr: ExprId,
        width: Width,
    },
    Not(ExprId),
    And(ExprId, ExprId),
    Or(ExprId, ExprId),
    Xor(ExprId, ExprId),
    Add(ExprId, ExprId),
    Sub(ExprId, ExprId),
    Mul(ExprId, ExprId),
    UDiv(ExprId, ExprId),
    SDiv(ExprId, ExprId),
    URem(ExprId, ExprId),
    SRem(ExprId, ExprId),
    Shl(ExprId, ExprId),
    LShr(ExprId, ExprId),
    AShr(ExprId, ExprId),
    Eq(ExprId, ExprId),
    Ult(ExprId, ExprId),
    Ule(ExprId, ExprId),
    Slt(ExprId, ExprId),
    Sle(ExprId, ExprId),
}

impl ExprData {
    fn rank(&self) -> u8 {
        match self {
            ExprData::Constant { .. } => 0,
            ExprData::Read { .. } => 1,
            ExprData::Ite { .. } => 2,
            ExprData::Concat { .. } => 3,
            ExprData::Extract { .. } => 4,
            ExprData::ZExt { .. } => 5,
            ExprData::SExt { .. } => 6,
            ExprData::Not(_) => 7,
            ExprData::And(..) => 8,
            ExprData::Or(..) => 9,
            ExprData::Xor(..) => 10,
            ExprData::Add(..) => 11,
            ExprData::Sub(..) => 12,
            ExprData::Mul(..) => 13,
            ExprData::UDiv(..) => 14,
            ExprData::SDiv(..) => 15,
            ExprData::URem(..) => 16,
            ExprData::SRem(..) => 17,
            ExprData::Shl(..) => 18,
            ExprData::LShr(..) => 19,
            ExprData::AShr(..) => 20,
            ExprData::Eq(..) => 21,
            ExprData::Ult(..) => 22,
            ExprData::Ule(..) => 23,
            ExprData::Slt(..) => 24,
            ExprData::Sle(..) => 25,
        }
    }

    /// Child expressions in a fixed order. Read children include the
    /// index and every update index/value pair.
    pub fn children(&self) -> Vec<ExprId> {
        match self {
            ExprData::Constant { .. } => Vec::new(),
            ExprData::Read { index, updates, .. } => {
                let mut out = vec![*index];
                for (i, v) in updates {
                    out.push(*i);
                    out.push(*v);
                }
                out
            }
            ExprData::Ite { cond, then, els } => vec![*cond, *then, *els],
            ExprData::Concat { msb, lsb } => vec![*msb, *lsb],
            ExprData::Extract { expr, .. }
            | ExprData::ZExt { expr, .. }
            | ExprData::SExt { expr, .. } => vec![*expr],
            ExprData::Not(e) => vec![*e],
            ExprData::And(a, b)
            | ExprData::Or(a, b)
            | ExprData::Xor(a, b)
            | ExprData::Add(a, b)
            | ExprData::Sub(a, b)
            | ExprData::Mul(a, b)
            | ExprData::UDiv(a, b)
            | ExprData::SDiv(a, b)
            | ExprData::URem(a, b)
            | ExprData::SRem(a, b)
            | ExprData::Shl(a, b)
            | ExprData::LShr(a, b)
            | ExprData::AShr(a, b)
            | ExprData::Eq(a, b)
            | ExprData::Ult(a, b)
            | ExprData::Ule(a, b)
            | ExprData::Slt(a, b)
            | ExprData::Sle(a, b) => vec![*a, *b],
        }
    }
}

#[derive(Default)]
struct StoreInner {
    data: Vec<ExprData>,
    width: Vec<Width>,
    intern: FxHashMap<ExprData, ExprId>,
    arrays: Vec<Array>,
    array_index: FxHashMap<String, ArrayId>,
}

impl StoreInner {
    fn cmp_array(&self, a: ArrayId, b: ArrayId) -> Ordering {
        let aa = &self.arrays[a.index()];
        let ab = &self.arrays[b.index()];
        aa.name
            .cmp(&ab.name)
            .then(aa.size.cmp(&ab.size))
            .then_with(|| aa.constant_values.cmp(&ab.constant_values))
    }

    fn cmp_expr(&self, a: ExprId, b: ExprId) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        let da = &self.data[a.index()];
        let db = &self.data[b.index()];
        let ord = da.rank().cmp(&db.rank());
        if ord != Ordering::Equal {
            return ord;
        }
        let ord = self.width[a.index()].cmp(&self.width[b.index()]);
        if ord != Ordering::Equal {
            return ord;
        }
        let ord = match (da, db) {
            (ExprData::Constant { value: va, .. }, ExprData::Constant { value: vb, .. }) => {
                va.cmp(vb)
            }
            (ExprData::Extract { offset: oa, .. }, ExprData::Extract { offset: ob, .. }) => {
                oa.cmp(ob)
            }
            (ExprData::Read { root: ra, .. }, ExprData::Read { root: rb, .. }) => {
                self.cmp_array(*ra, *rb)
            }
            _ => Ordering::Equal,
        };
        if ord != Ordering::Equal {
            return ord;
        }
        let ca = da.children();
        let cb = db.children();
        let ord = ca.len().cmp(&cb.len());
        if ord != Ordering::Equal {
            return ord;
        }
        for (&x, &y) in ca.iter().zip(cb.iter()) {
            let ord = self.cmp_expr(x, y);
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }
}

/// Arena of interned expressions and registered arrays.
#[derive(Default)]
pub struct ExprStore {
    inner: RefCell<StoreInner>,
}

impl ExprStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&self, data: ExprData) -> ExprId {
        let mut inner = self.inner.borrow_mut();
        if let Some(&id) = inner.intern.get(&data) {
            return id;
        }
        let width = match &data {
            ExprData::Constant { width, .. } => *width,
            ExprData::Read { .. } => 8,
            ExprData::Ite { then, .. } => inner.width[then.index()],
            ExprData::Concat { msb, lsb } => {
                inner.width[msb.index()] + inner.width[lsb.index()]
            }
            ExprData::Extract { width, .. }
            | ExprData::ZExt { width, .. }
            | ExprData::SExt { width, .. } => *width,
            ExprData::Eq(..)
            | ExprData::Ult(..)
            | ExprData::Ule(..)
            | ExprData::Slt(..)
            | ExprData::Sle(..) => 1,
            ExprData::Not(e) => inner.width[e.index()],
            ExprData::And(a, _)
            | ExprData::Or(a, _)
            | ExprData::Xor(a, _)
            | ExprData::Add(a, _)
            | ExprData::Sub(a, _)
            | ExprData::Mul(a, _)
            | ExprData::UDiv(a, _)
            | ExprData::SDiv(a, _)
            | ExprData::URem(a, _)
            | ExprData::SRem(a, _)
            | ExprData::Shl(a, _)
            | ExprData::LShr(a, _)
            | ExprData::AShr(a, _) => inner.width[a.index()],
        };
        let id = ExprId(inner.data.len() as u32);
        inner.data.push(data.clone());
        inner.width.push(width);
        inner.intern.insert(data, id);
        id
    }

    /// Register a symbolic array of `size` bytes, or return the existing
    /// id if `name` is already registered.
    pub fn array(&self, name: &str, size: u32) -> ArrayId {
        self.register(Array {
            name: name.to_string(),
            size,
            constant_values: None,
        })
    }

    /// Register a concrete array holding `values`.
    pub fn constant_array(&self, name: &str, values: &[u8]) -> ArrayId {
        self.register(Array {
            name: name.to_string(),
            size: values.len() as u32,
            constant_values: Some(values.to_vec()),
        })
    }

    fn register(&self, array: Array) -> ArrayId {
        let mut inner = self.inner.borrow_mut();
        if let Some(&id) = inner.array_index.get(&array.name) {
            return id;
        }
        let id = ArrayId(inner.arrays.len() as u32);
        inner.array_index.insert(array.name.clone(), id);
        inner.arrays.push(array);
        id
    }

    pub fn array_info(&self, id: ArrayId) -> Array {
        self.inner.borrow().arrays[id.index()].clone()
    }

    pub fn data(&self, id: ExprId) -> ExprData {
        self.inner.borrow().data[id.index()].clone()
    }

    pub fn width(&self, id: ExprId) -> Width {
        self.inner.borrow().width[id.index()]
    }

    /// Constants are masked to their width on construction.
    pub fn constant(&self, value: impl Into<BigUint>, width: Width) -> ExprId {
        let mask = (BigUint::one() << width) - BigUint::one();
        self.intern(ExprData::Constant {
            value: value.into() & mask,
            width,
        })
    }

    pub fn constant_bool(&self, value: bool) -> ExprId {
        self.constant(value as u8, 1)
    }

    pub fn true_expr(&self) -> ExprId {
        self.constant_bool(true)
    }

    pub fn false_expr(&self) -> ExprId {
        self.constant_bool(false)
    }

    pub fn as_constant(&self, id: ExprId) -> Option<BigUint> {
        match &self.inner.borrow().data[id.index()] {
            ExprData::Constant { value, .. } => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_false(&self, id: ExprId) -> bool {
        matches!(
            &self.inner.borrow().data[id.index()],
            ExprData::Constant { value, width: 1 } if value.is_zero()
        )
    }

    pub fn is_true(&self, id: ExprId) -> bool {
        matches!(
            &self.inner.borrow().data[id.index()],
            ExprData::Constant { value, width: 1 } if value.is_one()
        )
    }

    /// Read a cell of `root` through an update list (newest write first).
    pub fn read(&self, root: ArrayId, index: ExprId, updates: Vec<(ExprId, ExprId)>) -> ExprId {
        self.intern(ExprData::Read {
            root,
            index,
            updates,
        })
    }

    /// Read a cell at a concrete offset with no pending writes.
    pub fn read_byte(&self, root: ArrayId, offset: u32) -> ExprId {
        let index = self.constant(offset, 32);
        self.read(root, index, Vec::new())
    }

    pub fn ite(&self, cond: ExprId, then: ExprId, els: ExprId) -> ExprId {
        self.intern(ExprData::Ite { cond, then, els })
    }

    pub fn concat(&self, msb: ExprId, lsb: ExprId) -> ExprId {
        self.intern(ExprData::Concat { msb, lsb })
    }

    pub fn extract(&self, expr: ExprId, offset: u32, width: Width) -> ExprId {
        self.intern(ExprData::Extract {
            expr,
            offset,
            width,
        })
    }

    pub fn zext(&self, expr: ExprId, width: Width) -> ExprId {
        self.intern(ExprData::ZExt { expr, width })
    }

    pub fn sext(&self, expr: ExprId, width: Width) -> ExprId {
        self.intern(ExprData::SExt { expr, width })
    }

    /// Boolean/bitwise negation with double-negation elimination, so
    /// `not(not(e)) == e` and canonicalization stays idempotent.
    pub fn not(&self, e: ExprId) -> ExprId {
        match self.data(e) {
            ExprData::Not(inner) => inner,
            ExprData::Constant { value, width } if width == 1 => {
                self.constant_bool(value.is_zero())
            }
            _ => self.intern(ExprData::Not(e)),
        }
    }

    pub fn and(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::And(a, b))
    }

    pub fn or(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::Or(a, b))
    }

    pub fn xor(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::Xor(a, b))
    }

    pub fn add(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::Add(a, b))
    }

    pub fn sub(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::Sub(a, b))
    }

    pub fn mul(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::Mul(a, b))
    }

    pub fn udiv(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::UDiv(a, b))
    }

    pub fn sdiv(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::SDiv(a, b))
    }

    pub fn urem(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::URem(a, b))
    }

    pub fn srem(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::SRem(a, b))
    }

    pub fn shl(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::Shl(a, b))
    }

    pub fn lshr(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::LShr(a, b))
    }

    pub fn ashr(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::AShr(a, b))
    }

    pub fn eq(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::Eq(a, b))
    }

    pub fn ult(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::Ult(a, b))
    }

    pub fn ule(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::Ule(a, b))
    }

    pub fn slt(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::Slt(a, b))
    }

    pub fn sle(&self, a: ExprId, b: ExprId) -> ExprId {
        self.intern(ExprData::Sle(a, b))
    }

    /// Total order on expressions that depends only on structure, never
    /// on arena insertion order. Canonicalization relies on this being
    /// stable across processes.
    pub fn structural_cmp(&self, a: ExprId, b: ExprId) -> Ordering {
        self.inner.borrow().cmp_expr(a, b)
    }
}

impl std::fmt::Debug for ExprStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ExprStore")
            .field("exprs", &inner.data.len())
            .field("arrays", &inner.arrays.len())
            .finish()
    }
}

/// Visit every node reachable from `roots` exactly once, in DFS order.
/// Read nodes recurse into the index and all update expressions.
pub fn for_each_node(store: &ExprStore, roots: &[ExprId], mut f: impl FnMut(ExprId)) {
    let mut visited = rustc_hash::FxHashSet::default();
    let mut stack: Vec<ExprId> = roots.to_vec();
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        f(id);
        stack.extend(store.data(id).children());
    }
}

/// Symbolic arrays referenced by `roots`, deduplicated, in first-visit
/// order. Concrete arrays are skipped.
pub fn symbolic_arrays(store: &ExprStore, roots: &[ExprId]) -> Vec<ArrayId> {
    let mut seen = rustc_hash::FxHashSet::default();
    let mut out = Vec::new();
    for_each_node(store, roots, |id| {
        if let ExprData::Read { root, .. } = store.data(id) {
            if store.array_info(root).is_symbolic() && seen.insert(root) {
                out.push(root);
            }
        }
    });
    out
}
