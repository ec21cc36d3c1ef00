//! Pluggable key orderings.
//!
//! A tree is constructed with a single [`Comparator`] and every operation on
//! that tree, as well as any cross-tree diff, must use the same one. Whether
//! two trees "share" a comparator is decided by instance identity or by a
//! matching [order token](Comparator::order_token), so two independently
//! built trees over the same stock order can still be diffed.

use std::{any::TypeId, cmp::Ordering, sync::Arc};

/// A total order over keys.
///
/// `try_cmp` returns `None` when the pair cannot be ordered (the classic
/// example is NaN under a floating-point order); the engine maps that to
/// [`TreeError::UnorderableKey`](crate::TreeError::UnorderableKey) before any
/// structural change happens.
pub trait Comparator<K: ?Sized>: Send + Sync {
    fn try_cmp(&self, a: &K, b: &K) -> Option<Ordering>;

    /// A token identifying the order this comparator induces.
    ///
    /// Two trees may be diffed against each other when their comparators are
    /// the same instance or carry equal tokens. Stateless comparators return
    /// their own type; comparators whose order depends on captured state
    /// (closures included) keep the `None` default and therefore only match
    /// themselves by instance.
    fn order_token(&self) -> Option<TypeId> {
        None
    }
}

/// Whether two comparator handles are known to induce the same order.
pub(crate) fn same_order<K>(a: &Arc<dyn Comparator<K>>, b: &Arc<dyn Comparator<K>>) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    match (a.order_token(), b.order_token()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// The default comparator: the key type's own total order.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdComparator;

impl<K: Ord> Comparator<K> for OrdComparator {
    fn try_cmp(&self, a: &K, b: &K) -> Option<Ordering> {
        Some(a.cmp(b))
    }

    fn order_token(&self) -> Option<TypeId> {
        Some(TypeId::of::<OrdComparator>())
    }
}

/// Comparator for key types that only implement a partial order, such as
/// floats. Incomparable pairs surface as unorderable keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartialOrdComparator;

impl<K: PartialOrd> Comparator<K> for PartialOrdComparator {
    fn try_cmp(&self, a: &K, b: &K) -> Option<Ordering> {
        a.partial_cmp(b)
    }

    fn order_token(&self) -> Option<TypeId> {
        Some(TypeId::of::<PartialOrdComparator>())
    }
}

/// Reverses an inner comparator.
#[derive(Debug, Clone, Copy, Default)]
pub struct Reverse<C>(pub C);

impl<K, C: Comparator<K> + 'static> Comparator<K> for Reverse<C> {
    fn try_cmp(&self, a: &K, b: &K) -> Option<Ordering> {
        self.0.try_cmp(b, a)
    }

    /// Tokened iff the inner comparator is; a reversed closure stays
    /// identity-only.
    fn order_token(&self) -> Option<TypeId> {
        self.0.order_token().map(|_| TypeId::of::<Self>())
    }
}

/// Any `Fn(&K, &K) -> Option<Ordering>` closure is a comparator.
impl<K, F> Comparator<K> for F
where
    F: Fn(&K, &K) -> Option<Ordering> + Send + Sync,
{
    fn try_cmp(&self, a: &K, b: &K) -> Option<Ordering> {
        self(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ord_is_total() {
        assert_eq!(OrdComparator.try_cmp(&1, &2), Some(Ordering::Less));
        assert_eq!(OrdComparator.try_cmp(&2, &2), Some(Ordering::Equal));
    }

    #[test]
    fn partial_ord_rejects_nan() {
        assert_eq!(
            PartialOrdComparator.try_cmp(&1.0f64, &2.0),
            Some(Ordering::Less)
        );
        assert_eq!(PartialOrdComparator.try_cmp(&f64::NAN, &1.0), None);
        assert_eq!(PartialOrdComparator.try_cmp(&f64::NAN, &f64::NAN), None);
    }

    #[test]
    fn reverse_flips() {
        assert_eq!(
            Reverse(OrdComparator).try_cmp(&1, &2),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn closures_are_comparators() {
        let by_len = |a: &String, b: &String| Some(a.len().cmp(&b.len()));
        assert_eq!(
            by_len.try_cmp(&"aa".to_string(), &"b".to_string()),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn stock_comparators_share_an_order_token() {
        let a: Arc<dyn Comparator<i32>> = Arc::new(OrdComparator);
        let b: Arc<dyn Comparator<i32>> = Arc::new(OrdComparator);
        assert!(same_order(&a, &b));

        let reversed: Arc<dyn Comparator<i32>> = Arc::new(Reverse(OrdComparator));
        assert!(!same_order(&a, &reversed));

        let double_reversed: Arc<dyn Comparator<i32>> =
            Arc::new(Reverse(Reverse(OrdComparator)));
        assert!(!same_order(&reversed, &double_reversed));
    }

    #[test]
    fn closures_match_only_by_instance() {
        let cmp: Arc<dyn Comparator<i32>> = Arc::new(|a: &i32, b: &i32| Some(a.cmp(b)));
        assert!(same_order(&cmp, &cmp.clone()));

        let other: Arc<dyn Comparator<i32>> = Arc::new(|a: &i32, b: &i32| Some(a.cmp(b)));
        assert!(!same_order(&cmp, &other));
    }
}
