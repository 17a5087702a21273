// Interval algebra over the 128-bit key ring
//
// An interval is a set of arcs on the ring. Internally every interval is a
// normalized list of non-wrapping half-open spans over a doubled position
// space: key k occupies position (k, 0) and the boundary just after it
// position (k, 1). Open/closed endpoint flags, single points, wrapping
// arcs and the full-minus-one-point arc all reduce to the same span
// arithmetic. Arcs merge where their endpoint bounds meet exactly; the
// space is treated as continuous between neighboring keys.

use crate::keyspace::RingKey;

/// A position in the doubled ring space: (key, half) with half in {0, 1}.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct Pos(u128, u8);

impl Pos {
    const BOTTOM: Pos = Pos(0, 0);
}

/// Exclusive upper bound of a span: a finite position or the top of the space.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum PosEnd {
    At(Pos),
    Top,
}

/// Half-open [start, end) slice of the doubled space; never wraps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    start: Pos,
    end: PosEnd,
}

/// A set of arcs on the key ring.
///
/// Normalized: spans are sorted, pairwise disjoint and non-adjacent, and a
/// wrapping arc is stored split at key zero. Equality is therefore set
/// equality.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Interval {
    spans: Vec<Span>,
}

impl Interval {
    /// The empty interval
    pub fn empty() -> Self {
        Self { spans: Vec::new() }
    }

    /// The full ring
    pub fn all() -> Self {
        Self {
            spans: vec![Span {
                start: Pos::BOTTOM,
                end: PosEnd::Top,
            }],
        }
    }

    /// A single key
    pub fn point(key: RingKey) -> Self {
        Self::arc(key, true, key, true)
    }

    /// The open arc (left, right)
    pub fn open(left: RingKey, right: RingKey) -> Self {
        Self::arc(left, false, right, false)
    }

    /// The half-open arc [left, right)
    pub fn half_open(left: RingKey, right: RingKey) -> Self {
        Self::arc(left, true, right, false)
    }

    /// The closed arc [left, right]
    pub fn closed(left: RingKey, right: RingKey) -> Self {
        Self::arc(left, true, right, true)
    }

    /// The arc from `left` clockwise to `right` with per-endpoint
    /// open/closed flags.
    ///
    /// Equal endpoints: both closed is the single point, both open is the
    /// full ring minus the point, mixed flags denote the empty interval.
    pub fn arc(left: RingKey, left_closed: bool, right: RingKey, right_closed: bool) -> Self {
        let start = if left_closed {
            Pos(left.value(), 0)
        } else {
            Pos(left.value(), 1)
        };
        let end = if right_closed {
            Pos(right.value(), 1)
        } else {
            Pos(right.value(), 0)
        };

        if start == end {
            return Self::empty();
        }
        if start < end {
            return Self {
                spans: vec![Span {
                    start,
                    end: PosEnd::At(end),
                }],
            };
        }

        // Wrapping arc, stored split at key zero
        let mut spans = vec![Span {
            start,
            end: PosEnd::Top,
        }];
        if end > Pos::BOTTOM {
            spans.insert(
                0,
                Span {
                    start: Pos::BOTTOM,
                    end: PosEnd::At(end),
                },
            );
        }
        Self { spans }
    }

    /// Whether the interval contains no keys and no boundary segments
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Whether the interval covers the whole ring
    pub fn is_all(&self) -> bool {
        self.spans.len() == 1
            && self.spans[0].start == Pos::BOTTOM
            && self.spans[0].end == PosEnd::Top
    }

    /// Whether the key lies inside the interval, honoring endpoint flags
    pub fn contains(&self, key: RingKey) -> bool {
        let pos = Pos(key.value(), 0);
        self.spans
            .iter()
            .any(|s| s.start <= pos && PosEnd::At(pos) < s.end)
    }

    /// Set union
    pub fn union(&self, other: &Interval) -> Interval {
        let mut spans = self.spans.clone();
        spans.extend(other.spans.iter().cloned());
        Interval {
            spans: normalize(spans),
        }
    }

    /// Set intersection
    pub fn intersection(&self, other: &Interval) -> Interval {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.spans.len() && j < other.spans.len() {
            let a = &self.spans[i];
            let b = &other.spans[j];
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if PosEnd::At(start) < end {
                out.push(Span { start, end });
            }
            if a.end <= b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        Interval { spans: out }
    }

    /// Set complement
    pub fn complement(&self) -> Interval {
        let mut out = Vec::new();
        let mut cursor = Pos::BOTTOM;
        let mut reached_top = false;
        for s in &self.spans {
            if s.start > cursor {
                out.push(Span {
                    start: cursor,
                    end: PosEnd::At(s.start),
                });
            }
            match s.end {
                PosEnd::Top => {
                    reached_top = true;
                    break;
                }
                PosEnd::At(p) => cursor = p,
            }
        }
        if !reached_top {
            out.push(Span {
                start: cursor,
                end: PosEnd::Top,
            });
        }
        Interval { spans: out }
    }

    /// Whether `self` is a subset of `other`
    pub fn subset(&self, other: &Interval) -> bool {
        self.intersection(&other.complement()).is_empty()
    }

    /// Whether `self`'s clockwise end meets `other`'s counterclockwise
    /// start exactly.
    ///
    /// Meaningful for contiguous arcs; empty and full intervals are never
    /// left of anything.
    pub fn is_left_of(&self, other: &Interval) -> bool {
        let (Some((_, my_end)), Some((their_start, _))) =
            (self.ring_bounds(), other.ring_bounds())
        else {
            return false;
        };
        match my_end {
            PosEnd::Top => their_start == Pos::BOTTOM,
            PosEnd::At(p) => p == their_start,
        }
    }

    /// Split the full ring into `n` half-open arcs `[a, b)` of near-equal
    /// length.
    ///
    /// The arcs are pairwise disjoint and their union is the whole ring.
    /// When n does not divide 2^128 the remainder r = 2^128 mod n is
    /// spread one key each over the first r arcs.
    pub fn split(n: usize) -> Vec<Interval> {
        assert!(n >= 1, "split requires at least one bucket");
        if n == 1 {
            return vec![Interval::all()];
        }

        let parts = n as u128;
        let mut base = u128::MAX / parts;
        let mut extra = (u128::MAX % parts) + 1;
        if extra == parts {
            base += 1;
            extra = 0;
        }

        let mut out = Vec::with_capacity(n);
        let mut cursor: u128 = 0;
        for i in 0..n {
            let len = if (i as u128) < extra { base + 1 } else { base };
            let next = cursor.wrapping_add(len);
            out.push(Interval::half_open(RingKey::new(cursor), RingKey::new(next)));
            cursor = next;
        }
        out
    }

    /// Number of keys contained, saturating at u128::MAX for the full ring
    pub fn size(&self) -> u128 {
        let mut total: u128 = 0;
        for s in &self.spans {
            total = total.saturating_add(span_key_count(s));
        }
        total
    }

    /// Outermost (start, end) of the interval in ring order, reassembling
    /// an arc stored split at zero. None for empty and full intervals.
    fn ring_bounds(&self) -> Option<(Pos, PosEnd)> {
        if self.is_all() {
            return None;
        }
        let (Some(first), Some(last)) = (self.spans.first(), self.spans.last()) else {
            return None;
        };
        let wraps =
            self.spans.len() >= 2 && first.start == Pos::BOTTOM && last.end == PosEnd::Top;
        if wraps {
            Some((last.start, first.end))
        } else {
            Some((first.start, last.end))
        }
    }
}

/// Count keys (even positions) covered by a span
fn span_key_count(s: &Span) -> u128 {
    let Pos(start_key, start_half) = s.start;
    let lo = if start_half == 0 {
        start_key
    } else {
        match start_key.checked_add(1) {
            Some(v) => v,
            None => return 0,
        }
    };
    let hi = match s.end {
        PosEnd::Top => u128::MAX,
        PosEnd::At(Pos(end_key, end_half)) => {
            if end_half == 1 {
                end_key
            } else if end_key == 0 {
                return 0;
            } else {
                end_key - 1
            }
        }
    };
    if hi < lo {
        0
    } else {
        (hi - lo).saturating_add(1)
    }
}

/// Sort spans and merge overlapping or exactly adjacent ones
fn normalize(mut spans: Vec<Span>) -> Vec<Span> {
    if spans.is_empty() {
        return spans;
    }
    spans.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));
    let mut out: Vec<Span> = Vec::with_capacity(spans.len());
    for s in spans {
        match out.last_mut() {
            Some(prev) if PosEnd::At(s.start) <= prev.end => {
                prev.end = prev.end.max(s.end);
            }
            _ => out.push(s),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn k(v: u128) -> RingKey {
        RingKey::new(v)
    }

    #[test]
    fn endpoint_flags_are_honored() {
        let half = Interval::half_open(k(10), k(20));
        assert!(half.contains(k(10)));
        assert!(half.contains(k(19)));
        assert!(!half.contains(k(20)));

        let open = Interval::open(k(10), k(20));
        assert!(!open.contains(k(10)));
        assert!(open.contains(k(11)));
        assert!(!open.contains(k(20)));

        let closed = Interval::closed(k(10), k(20));
        assert!(closed.contains(k(10)));
        assert!(closed.contains(k(20)));
        assert!(!closed.contains(k(21)));
    }

    #[test]
    fn point_and_all_minus_point() {
        let p = Interval::point(k(7));
        assert!(p.contains(k(7)));
        assert!(!p.contains(k(8)));
        assert_eq!(p.size(), 1);

        let rest = Interval::open(k(7), k(7));
        assert!(!rest.contains(k(7)));
        assert!(rest.contains(k(8)));
        assert!(rest.contains(k(6)));
        assert!(!rest.is_all());
        assert!(p.union(&rest).is_all());
    }

    #[test]
    fn wrapping_arc() {
        let w = Interval::half_open(k(u128::MAX - 1), k(2));
        assert!(w.contains(k(u128::MAX - 1)));
        assert!(w.contains(k(u128::MAX)));
        assert!(w.contains(k(0)));
        assert!(w.contains(k(1)));
        assert!(!w.contains(k(2)));
        assert_eq!(w.size(), 4);
    }

    #[test]
    fn union_merges_adjacent_arcs() {
        let a = Interval::half_open(k(0), k(10));
        let b = Interval::half_open(k(10), k(20));
        let ab = a.union(&b);
        assert_eq!(ab, Interval::half_open(k(0), k(20)));

        let c = Interval::closed(k(30), k(40));
        let d = Interval::open(k(40), k(50));
        let cd = c.union(&d);
        assert_eq!(cd, Interval::arc(k(30), true, k(50), false));
    }

    #[test]
    fn union_keeps_disjoint_arcs_apart() {
        let a = Interval::half_open(k(0), k(10));
        let b = Interval::half_open(k(20), k(30));
        let ab = a.union(&b);
        assert!(ab.contains(k(5)));
        assert!(!ab.contains(k(15)));
        assert!(ab.contains(k(25)));
        assert_eq!(ab.size(), 20);
    }

    #[test]
    fn intersection_of_overlapping_arcs() {
        let a = Interval::half_open(k(0), k(20));
        let b = Interval::half_open(k(10), k(30));
        assert_eq!(a.intersection(&b), Interval::half_open(k(10), k(20)));

        let w = Interval::half_open(k(u128::MAX - 10), k(10));
        let z = Interval::half_open(k(0), k(5));
        assert_eq!(w.intersection(&z), Interval::half_open(k(0), k(5)));
    }

    #[test]
    fn intersection_of_disjoint_arcs_is_empty() {
        let a = Interval::open(k(0), k(10));
        let b = Interval::open(k(10), k(20));
        assert!(a.intersection(&b).is_empty());
    }

    #[test]
    fn complement_and_subset() {
        let a = Interval::half_open(k(10), k(20));
        let c = a.complement();
        assert!(!c.contains(k(10)));
        assert!(c.contains(k(20)));
        assert!(c.contains(k(5)));
        assert!(a.union(&c).is_all());
        assert!(a.intersection(&c).is_empty());

        let inner = Interval::closed(k(12), k(15));
        assert!(inner.subset(&a));
        assert!(!a.subset(&inner));
        assert!(a.subset(&Interval::all()));
        assert!(Interval::empty().subset(&a));
    }

    #[test]
    fn is_left_of_adjacent_arcs() {
        let a = Interval::half_open(k(0), k(10));
        let b = Interval::half_open(k(10), k(20));
        assert!(a.is_left_of(&b));
        assert!(!b.is_left_of(&a));

        // Closed/open adjacency at the same key
        let c = Interval::closed(k(20), k(30));
        let d = Interval::open(k(30), k(40));
        assert!(c.is_left_of(&d));

        // Adjacency across the zero wrap
        let e = Interval::half_open(k(100), k(0));
        let f = Interval::half_open(k(0), k(100));
        assert!(e.is_left_of(&f));
        assert!(f.is_left_of(&e));
    }

    #[test]
    fn split_partitions_the_ring() {
        let parts = Interval::split(7);
        assert_eq!(parts.len(), 7);

        // Union covers everything
        let mut union = Interval::empty();
        for p in &parts {
            union = union.union(p);
        }
        assert!(union.is_all());

        // Pairwise disjoint
        for i in 0..parts.len() {
            for j in 0..parts.len() {
                if i != j {
                    assert!(parts[i].intersection(&parts[j]).is_empty());
                }
            }
        }

        // Lengths differ by at most one
        let sizes: Vec<u128> = parts.iter().map(|p| p.size()).collect();
        let min = sizes.iter().min().copied().expect("non-empty");
        let max = sizes.iter().max().copied().expect("non-empty");
        assert!(max - min <= 1);

        // Consecutive arcs are adjacent in ring order
        for i in 0..parts.len() {
            assert!(parts[i].is_left_of(&parts[(i + 1) % parts.len()]));
        }
    }

    #[test]
    fn split_by_power_of_two_has_exact_bounds() {
        let parts = Interval::split(4);
        let quarter = 1u128 << 126;
        for (i, p) in parts.iter().enumerate() {
            assert!(p.contains(k(quarter * i as u128)));
            assert_eq!(p.size(), quarter);
        }
        assert!(!parts[0].contains(k(quarter)));
    }

    #[test]
    fn split_one_is_all() {
        let parts = Interval::split(1);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].is_all());
    }

    #[test]
    fn mixed_flag_degenerate_arc_is_empty() {
        assert!(Interval::half_open(k(5), k(5)).is_empty());
        assert!(Interval::arc(k(5), false, k(5), true).is_empty());
    }
}
