use std::fmt;

use smallvec::SmallVec;

use crate::math::Aabb;

/// Path of octant indices from the root. The root is the empty path; depth
/// equals the path length. Lexicographic ordering puts a parent before all
/// of its descendants, which gives the canonical emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey(SmallVec<[u8; 16]>);

impl NodeKey {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn child(&self, octant: u8) -> Self {
        debug_assert!(octant < 8);
        let mut path = self.0.clone();
        path.push(octant);
        Self(path)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        let mut path = self.0.clone();
        path.pop();
        Some(Self(path))
    }

    pub fn octants(&self) -> impl Iterator<Item = u8> + '_ {
        self.0.iter().copied()
    }

    /// Derive this node's cube from the root cube.
    pub fn bounds_in(&self, root: &Aabb) -> Aabb {
        self.0
            .iter()
            .fold(*root, |aabb, &octant| aabb.octant(octant as usize))
    }

    /// File stem used by the node store: `r` followed by octal digits.
    pub fn file_stem(&self) -> String {
        let mut stem = String::with_capacity(1 + self.0.len());
        stem.push('r');
        for octant in &self.0 {
            stem.push(char::from(b'0' + octant));
        }
        stem
    }

    pub fn parse_stem(stem: &str) -> Option<Self> {
        let rest = stem.strip_prefix('r')?;
        let mut path = SmallVec::new();
        for c in rest.chars() {
            let digit = c.to_digit(8)?;
            path.push(digit as u8);
        }
        Some(Self(path))
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_and_children_stems() {
        let root = NodeKey::root();
        assert_eq!(root.file_stem(), "r");
        let child = root.child(4).child(0).child(6);
        assert_eq!(child.file_stem(), "r406");
        assert_eq!(child.depth(), 3);
        assert_eq!(child.parent().unwrap().file_stem(), "r40");
    }

    #[test]
    fn parse_stem_round_trips() {
        for stem in ["r", "r0", "r7654", "r01234567"] {
            let key = NodeKey::parse_stem(stem).unwrap();
            assert_eq!(key.file_stem(), stem);
        }
        assert!(NodeKey::parse_stem("x0").is_none());
        assert!(NodeKey::parse_stem("r8").is_none());
    }

    #[test]
    fn ordering_puts_parents_first() {
        let root = NodeKey::root();
        let a = root.child(0);
        let b = root.child(0).child(3);
        let c = root.child(1);
        let mut keys = vec![c.clone(), b.clone(), a.clone(), root.clone()];
        keys.sort();
        assert_eq!(keys, vec![root, a, b, c]);
    }

    #[test]
    fn bounds_derivation_is_deterministic() {
        let root = Aabb::new([0.0, 0.0, 0.0], [8.0, 8.0, 8.0]);
        let key = NodeKey::root().child(7).child(0);
        let bounds = key.bounds_in(&root);
        assert_eq!(bounds.min, [4.0, 4.0, 4.0]);
        assert_eq!(bounds.max, [6.0, 6.0, 6.0]);
    }
}
