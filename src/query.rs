//! Queries, constraint sets and validity lattices
//!
//! A [`Query`] asks whether a constraint set entails a boolean goal
//! expression. [`Validity`] is the three-valued answer a solver gives;
//! [`PartialValidity`] is the five-valued knowledge state the cache
//! layers track, which also travels over the wire to the cache daemon.

use std::hash::{Hash, Hasher};

use num_bigint::{BigInt, BigUint};
use num_traits::{One, Signed, ToPrimitive, Zero};
use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use serde::{Deserialize, Serialize};

use crate::expr::{ArrayId, ExprData, ExprId, ExprStore, Width};

/// Insertion-ordered, duplicate-free set of boolean constraints.
///
/// Equality and hashing are order-insensitive so that `{A, B}` and
/// `{B, A}` form the same cache key.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    exprs: Vec<ExprId>,
    members: FxHashSet<ExprId>,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_exprs(exprs: impl IntoIterator<Item = ExprId>) -> Self {
        let mut set = Self::new();
        for e in exprs {
            set.push(e);
        }
        set
    }

    /// Append a constraint; duplicates are ignored. Returns whether the
    /// set grew.
    pub fn push(&mut self, e: ExprId) -> bool {
        if self.members.insert(e) {
            self.exprs.push(e);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, e: ExprId) -> bool {
        self.members.contains(&e)
    }

    pub fn iter(&self) -> impl Iterator<Item = ExprId> + '_ {
        self.exprs.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }
}

impl PartialEq for ConstraintSet {
    fn eq(&self, other: &Self) -> bool {
        self.members == other.members
    }
}

impl Eq for ConstraintSet {}

impl Hash for ConstraintSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // XOR of per-element hashes keeps the hash order-insensitive.
        let mut acc: u64 = 0;
        for &e in &self.exprs {
            let mut h = FxHasher::default();
            e.hash(&mut h);
            acc ^= h.finish();
        }
        state.write_u64(acc);
    }
}

impl<'a> IntoIterator for &'a ConstraintSet {
    type Item = ExprId;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, ExprId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.exprs.iter().copied()
    }
}

/// "Do the constraints entail the goal?"
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    pub constraints: ConstraintSet,
    pub goal: ExprId,
}

impl Query {
    pub fn new(constraints: ConstraintSet, goal: ExprId) -> Self {
        Self { constraints, goal }
    }

    /// Same constraints, negated goal.
    pub fn negate(&self, store: &ExprStore) -> Query {
        Query {
            constraints: self.constraints.clone(),
            goal: store.not(self.goal),
        }
    }

    /// Same constraints, goal replaced by `false`. Useful when only the
    /// satisfiability of the constraints themselves matters.
    pub fn with_false(&self, store: &ExprStore) -> Query {
        Query {
            constraints: self.constraints.clone(),
            goal: store.false_expr(),
        }
    }
}

/// Definitive answer to a validity query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Validity {
    /// Constraints entail the goal.
    True,
    /// Constraints entail the negated goal.
    False,
    /// Both the goal and its negation are satisfiable.
    Unknown,
}

impl Validity {
    pub fn negate(self) -> Validity {
        match self {
            Validity::True => Validity::False,
            Validity::False => Validity::True,
            Validity::Unknown => Validity::Unknown,
        }
    }
}

/// Five-valued knowledge state tracked by the cache layers.
///
/// `MayBeTrue`/`MayBeFalse` record one-sided knowledge (a satisfying
/// assignment is known to exist for the goal / its negation) that later
/// queries can refine into a definitive answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartialValidity {
    MustBeTrue,
    MustBeFalse,
    TrueOrFalse,
    MayBeTrue,
    MayBeFalse,
    None,
}

impl PartialValidity {
    /// Knowledge about the negated goal. Involution.
    pub fn negate(self) -> PartialValidity {
        match self {
            PartialValidity::MustBeTrue => PartialValidity::MustBeFalse,
            PartialValidity::MustBeFalse => PartialValidity::MustBeTrue,
            PartialValidity::MayBeTrue => PartialValidity::MayBeFalse,
            PartialValidity::MayBeFalse => PartialValidity::MayBeTrue,
            PartialValidity::TrueOrFalse => PartialValidity::TrueOrFalse,
            PartialValidity::None => PartialValidity::None,
        }
    }

    /// Wire tag shared with the cache daemon. `None` is never sent.
    pub fn to_wire(self) -> Option<u8> {
        match self {
            PartialValidity::MayBeFalse => Some(0),
            PartialValidity::MustBeFalse => Some(1),
            PartialValidity::TrueOrFalse => Some(2),
            PartialValidity::MustBeTrue => Some(3),
            PartialValidity::MayBeTrue => Some(4),
            PartialValidity::None => Option::None,
        }
    }

    pub fn from_wire(tag: u8) -> Option<PartialValidity> {
        match tag {
            0 => Some(PartialValidity::MayBeFalse),
            1 => Some(PartialValidity::MustBeFalse),
            2 => Some(PartialValidity::TrueOrFalse),
            3 => Some(PartialValidity::MustBeTrue),
            4 => Some(PartialValidity::MayBeTrue),
            _ => Option::None,
        }
    }
}

/// Concrete byte values for symbolic arrays.
///
/// Unassigned cells read as zero; reads walk the update list newest
/// write first before falling through to the backing array.
#[derive(Debug, Clone, Default)]
pub struct Assignment {
    values: FxHashMap<ArrayId, Vec<u8>>,
}

impl Assignment {
    pub fn new(arrays: &[ArrayId], values: Vec<Vec<u8>>) -> Self {
        Self {
            values: arrays.iter().copied().zip(values).collect(),
        }
    }

    pub fn bytes_for(&self, array: ArrayId) -> Option<&[u8]> {
        self.values.get(&array).map(|v| v.as_slice())
    }

    /// Fold `expr` to a concrete value under this assignment. All
    /// arithmetic is modulo `2^width`; signed operators use two's
    /// complement.
    pub fn evaluate(&self, store: &ExprStore, expr: ExprId) -> BigUint {
        let mut memo = FxHashMap::default();
        self.eval(store, expr, &mut memo)
    }

    /// `evaluate` interpreted as a boolean (nonzero is true).
    pub fn evaluate_bool(&self, store: &ExprStore, expr: ExprId) -> bool {
        !self.evaluate(store, expr).is_zero()
    }

    fn eval(
        &self,
        store: &ExprStore,
        expr: ExprId,
        memo: &mut FxHashMap<ExprId, BigUint>,
    ) -> BigUint {
        if let Some(v) = memo.get(&expr) {
            return v.clone();
        }
        let width = store.width(expr);
        let value = match store.data(expr) {
            ExprData::Constant { value, .. } => value,
            ExprData::Read {
                root,
                index,
                updates,
            } => {
                let idx = self.eval(store, index, memo);
                let mut result = Option::None;
                for (ui, uv) in updates {
                    if self.eval(store, ui, memo) == idx {
                        result = Some(self.eval(store, uv, memo));
                        break;
                    }
                }
                result.unwrap_or_else(|| {
                    let offset = idx.to_usize().unwrap_or(usize::MAX);
                    let array = store.array_info(root);
                    let byte = match &array.constant_values {
                        Some(values) => values.get(offset).copied().unwrap_or(0),
                        Option::None => self
                            .values
                            .get(&root)
                            .and_then(|v| v.get(offset))
                            .copied()
                            .unwrap_or(0),
                    };
                    BigUint::from(byte)
                })
            }
            ExprData::Ite { cond, then, els } => {
                if self.eval(store, cond, memo).is_zero() {
                    self.eval(store, els, memo)
                } else {
                    self.eval(store, then, memo)
                }
            }
            ExprData::Concat { msb, lsb } => {
                let lw = store.width(lsb);
                (self.eval(store, msb, memo) << lw) | self.eval(store, lsb, memo)
            }
            ExprData::Extract {
                expr: e,
                offset,
                width: w,
            } => (self.eval(store, e, memo) >> offset) & low_mask(w),
            ExprData::ZExt { expr: e, .. } => self.eval(store, e, memo),
            ExprData::SExt { expr: e, width: w } => {
                let from = store.width(e);
                let v = self.eval(store, e, memo);
                if sign_bit(&v, from) {
                    v + ((BigUint::one() << w) - (BigUint::one() << from))
                } else {
                    v
                }
            }
            ExprData::Not(e) => self.eval(store, e, memo) ^ low_mask(width),
            ExprData::And(a, b) => self.eval(store, a, memo) & self.eval(store, b, memo),
            ExprData::Or(a, b) => self.eval(store, a, memo) | self.eval(store, b, memo),
            ExprData::Xor(a, b) => self.eval(store, a, memo) ^ self.eval(store, b, memo),
            ExprData::Add(a, b) => {
                (self.eval(store, a, memo) + self.eval(store, b, memo)) & low_mask(width)
            }
            ExprData::Sub(a, b) => {
                let b = self.eval(store, b, memo);
                let neg_b = ((BigUint::one() << width) - b) & low_mask(width);
                (self.eval(store, a, memo) + neg_b) & low_mask(width)
            }
            ExprData::Mul(a, b) => {
                (self.eval(store, a, memo) * self.eval(store, b, memo)) & low_mask(width)
            }
            ExprData::UDiv(a, b) => {
                let b = self.eval(store, b, memo);
                if b.is_zero() {
                    low_mask(width)
                } else {
                    self.eval(store, a, memo) / b
                }
            }
            ExprData::URem(a, b) => {
                let b = self.eval(store, b, memo);
                if b.is_zero() {
                    self.eval(store, a, memo)
                } else {
                    self.eval(store, a, memo) % b
                }
            }
            ExprData::SDiv(a, b) => {
                let sa = to_signed(&self.eval(store, a, memo), width);
                let sb = to_signed(&self.eval(store, b, memo), width);
                if sb.is_zero() {
                    // bvsdiv x 0 = -1 for x >= 0, 1 otherwise
                    if sa.is_negative() {
                        to_unsigned(BigInt::one(), width)
                    } else {
                        to_unsigned(-BigInt::one(), width)
                    }
                } else {
                    to_unsigned(sa / sb, width)
                }
            }
            ExprData::SRem(a, b) => {
                let sa = to_signed(&self.eval(store, a, memo), width);
                let sb = to_signed(&self.eval(store, b, memo), width);
                if sb.is_zero() {
                    to_unsigned(sa, width)
                } else {
                    to_unsigned(sa % sb, width)
                }
            }
            ExprData::Shl(a, b) => {
                let shift = self.eval(store, b, memo).to_u64().unwrap_or(u64::MAX);
                if shift >= u64::from(width) {
                    BigUint::zero()
                } else {
                    (self.eval(store, a, memo) << shift) & low_mask(width)
                }
            }
            ExprData::LShr(a, b) => {
                let shift = self.eval(store, b, memo).to_u64().unwrap_or(u64::MAX);
                if shift >= u64::from(width) {
                    BigUint::zero()
                } else {
                    self.eval(store, a, memo) >> shift
                }
            }
            ExprData::AShr(a, b) => {
                let shift = self.eval(store, b, memo).to_u64().unwrap_or(u64::MAX);
                let sa = to_signed(&self.eval(store, a, memo), width);
                if shift >= u64::from(width) {
                    if sa.is_negative() {
                        low_mask(width)
                    } else {
                        BigUint::zero()
                    }
                } else {
                    to_unsigned(sa >> shift, width)
                }
            }
            ExprData::Eq(a, b) => {
                bool_value(self.eval(store, a, memo) == self.eval(store, b, memo))
            }
            ExprData::Ult(a, b) => {
                bool_value(self.eval(store, a, memo) < self.eval(store, b, memo))
            }
            ExprData::Ule(a, b) => {
                bool_value(self.eval(store, a, memo) <= self.eval(store, b, memo))
            }
            ExprData::Slt(a, b) => {
                let w = store.width(a);
                bool_value(
                    to_signed(&self.eval(store, a, memo), w)
                        < to_signed(&self.eval(store, b, memo), w),
                )
            }
            ExprData::Sle(a, b) => {
                let w = store.width(a);
                bool_value(
                    to_signed(&self.eval(store, a, memo), w)
                        <= to_signed(&self.eval(store, b, memo), w),
                )
            }
        };
        memo.insert(expr, value.clone());
        value
    }
}

fn low_mask(width: Width) -> BigUint {
    (BigUint::one() << width) - BigUint::one()
}

fn sign_bit(value: &BigUint, width: Width) -> bool {
    !((value >> (width - 1)) & BigUint::one()).is_zero()
}

fn to_signed(value: &BigUint, width: Width) -> BigInt {
    if sign_bit(value, width) {
        BigInt::from(value.clone()) - (BigInt::one() << width)
    } else {
        BigInt::from(value.clone())
    }
}

fn to_unsigned(value: BigInt, width: Width) -> BigUint {
    let modulus = BigInt::one() << width;
    let reduced = ((value % &modulus) + &modulus) % modulus;
    reduced.to_biguint().unwrap_or_default()
}

fn bool_value(b: bool) -> BigUint {
    if b {
        BigUint::one()
    } else {
        BigUint::zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash_of<T: Hash>(t: &T) -> u64 {
        let mut h = FxHasher::default();
        t.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_constraint_set_dedupes() {
        let store = ExprStore::new();
        let a = store.array("a", 1);
        let e = store.eq(store.read_byte(a, 0), store.constant(1u32, 8));
        let mut set = ConstraintSet::new();
        assert!(set.push(e));
        assert!(!set.push(e));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_constraint_set_order_insensitive() {
        let store = ExprStore::new();
        let a = store.array("a", 1);
        let e1 = store.eq(store.read_byte(a, 0), store.constant(1u32, 8));
        let e2 = store.eq(store.read_byte(a, 0), store.constant(2u32, 8));
        let s1 = ConstraintSet::from_exprs([e1, e2]);
        let s2 = ConstraintSet::from_exprs([e2, e1]);
        assert_eq!(s1, s2);
        assert_eq!(hash_of(&s1), hash_of(&s2));
        // iteration order is still insertion order
        assert_eq!(s1.iter().collect::<Vec<_>>(), vec![e1, e2]);
    }

    #[test]
    fn test_validity_negate() {
        assert_eq!(Validity::True.negate(), Validity::False);
        assert_eq!(Validity::False.negate(), Validity::True);
        assert_eq!(Validity::Unknown.negate(), Validity::Unknown);
    }

    const ALL_PARTIAL: [PartialValidity; 6] = [
        PartialValidity::MustBeTrue,
        PartialValidity::MustBeFalse,
        PartialValidity::TrueOrFalse,
        PartialValidity::MayBeTrue,
        PartialValidity::MayBeFalse,
        PartialValidity::None,
    ];

    #[test]
    fn test_partial_validity_negate_involution() {
        for pv in ALL_PARTIAL {
            assert_eq!(pv.negate().negate(), pv);
        }
        assert_eq!(
            PartialValidity::MustBeTrue.negate(),
            PartialValidity::MustBeFalse
        );
        assert_eq!(
            PartialValidity::MayBeFalse.negate(),
            PartialValidity::MayBeTrue
        );
    }

    #[test]
    fn test_partial_validity_wire_round_trip() {
        for pv in ALL_PARTIAL {
            match pv.to_wire() {
                Some(tag) => assert_eq!(PartialValidity::from_wire(tag), Some(pv)),
                Option::None => assert_eq!(pv, PartialValidity::None),
            }
        }
        assert_eq!(PartialValidity::from_wire(9), Option::None);
    }

    #[test]
    fn test_query_negate_round_trip() {
        let store = ExprStore::new();
        let a = store.array("a", 1);
        let goal = store.ult(store.read_byte(a, 0), store.constant(10u32, 8));
        let q = Query::new(ConstraintSet::new(), goal);
        let n = q.negate(&store);
        assert_ne!(q, n);
        assert_eq!(n.negate(&store), q);
    }

    #[test]
    fn test_evaluate_arithmetic() {
        let store = ExprStore::new();
        let asg = Assignment::default();
        let a = store.constant(200u32, 8);
        let b = store.constant(100u32, 8);
        assert_eq!(asg.evaluate(&store, store.add(a, b)), BigUint::from(44u32));
        assert_eq!(asg.evaluate(&store, store.sub(b, a)), BigUint::from(156u32));
        assert_eq!(asg.evaluate(&store, store.mul(a, b)), BigUint::from(32u32));
    }

    #[test]
    fn test_evaluate_signed_comparison() {
        let store = ExprStore::new();
        let asg = Assignment::default();
        let minus_one = store.constant(0xffu32, 8);
        let one = store.constant(1u32, 8);
        assert!(asg.evaluate_bool(&store, store.slt(minus_one, one)));
        assert!(!asg.evaluate_bool(&store, store.ult(minus_one, one)));
    }

    #[test]
    fn test_evaluate_sext_ashr() {
        let store = ExprStore::new();
        let asg = Assignment::default();
        let minus_two = store.constant(0xfeu32, 8);
        let wide = store.sext(minus_two, 16);
        assert_eq!(asg.evaluate(&store, wide), BigUint::from(0xfffeu32));
        let shifted = store.ashr(minus_two, store.constant(1u32, 8));
        assert_eq!(asg.evaluate(&store, shifted), BigUint::from(0xffu32));
    }

    #[test]
    fn test_evaluate_division_by_zero() {
        let store = ExprStore::new();
        let asg = Assignment::default();
        let x = store.constant(7u32, 8);
        let zero = store.constant(0u32, 8);
        assert_eq!(
            asg.evaluate(&store, store.udiv(x, zero)),
            BigUint::from(0xffu32)
        );
        assert_eq!(asg.evaluate(&store, store.urem(x, zero)), BigUint::from(7u32));
        assert_eq!(asg.evaluate(&store, store.srem(x, zero)), BigUint::from(7u32));
    }

    #[test]
    fn test_evaluate_read_with_updates() {
        let store = ExprStore::new();
        let arr = store.array("a", 2);
        let asg = Assignment::new(&[arr], vec![vec![10, 20]]);
        assert_eq!(
            asg.evaluate(&store, store.read_byte(arr, 1)),
            BigUint::from(20u32)
        );
        // a newer write shadows the backing bytes
        let idx = store.constant(1u32, 32);
        let val = store.constant(99u32, 8);
        let shadowed = store.read(arr, idx, vec![(idx, val)]);
        assert_eq!(asg.evaluate(&store, shadowed), BigUint::from(99u32));
    }

    #[test]
    fn test_evaluate_unassigned_defaults_to_zero() {
        let store = ExprStore::new();
        let arr = store.array("free", 4);
        let asg = Assignment::default();
        assert_eq!(
            asg.evaluate(&store, store.read_byte(arr, 3)),
            BigUint::zero()
        );
    }

    #[test]
    fn test_evaluate_concat_extract() {
        let store = ExprStore::new();
        let asg = Assignment::default();
        let hi = store.constant(0xabu32, 8);
        let lo = store.constant(0xcdu32, 8);
        let pair = store.concat(hi, lo);
        assert_eq!(asg.evaluate(&store, pair), BigUint::from(0xabcdu32));
        let back = store.extract(pair, 8, 8);
        assert_eq!(asg.evaluate(&store, back), BigUint::from(0xabu32));
    }
}
