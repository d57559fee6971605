use std::collections::HashMap;

use crate::body::BodyId;
use crate::interaction::ordered;




/**
 * Per-body index from neighbour id to the dense position of the interaction
 * between the two. Only the body with the smaller id of a pair carries the
 * entry. The index does not own interactions; positions point into the
 * registry's dense sequence and must be rewritten whenever an interaction is
 * moved there.
 */
#[derive(Clone, Debug, Default)]
pub struct BodyAdjacency {
    maps: Vec<HashMap<BodyId, usize>>,
}




// ============================================================================
impl BodyAdjacency {


    pub fn new() -> Self {
        Self::default()
    }


    /**
     * Return the number of bodies covered by the index.
     */
    pub fn num_bodies(&self) -> usize {
        self.maps.len()
    }


    /**
     * Make room for bodies with ids below `n`. Shrinking drops entries of
     * the removed bodies.
     */
    pub fn resize(&mut self, n: usize) {
        self.maps.resize_with(n, HashMap::new)
    }


    /**
     * Return the number of stored pairs.
     */
    pub fn len(&self) -> usize {
        self.maps.iter().map(HashMap::len).sum()
    }


    pub fn is_empty(&self) -> bool {
        self.maps.iter().all(HashMap::is_empty)
    }


    /**
     * Record the pair (a, b) at dense position `pos`. Returns false if the
     * pair was already present, in which case nothing changes.
     */
    pub fn insert(&mut self, a: BodyId, b: BodyId, pos: usize) -> bool {
        let (lo, hi) = ordered(a, b);
        let map = &mut self.maps[lo];
        if map.contains_key(&hi) {
            false
        } else {
            map.insert(hi, pos);
            true
        }
    }


    /**
     * Look up the dense position of the pair (a, b).
     */
    pub fn get(&self, a: BodyId, b: BodyId) -> Option<usize> {
        let (lo, hi) = ordered(a, b);
        self.maps.get(lo).and_then(|map| map.get(&hi)).copied()
    }


    pub fn contains(&self, a: BodyId, b: BodyId) -> bool {
        self.get(a, b).is_some()
    }


    /**
     * Point an existing pair at a new dense position.
     */
    pub fn relocate(&mut self, a: BodyId, b: BodyId, pos: usize) {
        let (lo, hi) = ordered(a, b);
        if let Some(p) = self.maps[lo].get_mut(&hi) {
            *p = pos
        }
    }


    /**
     * Remove a pair if it exists, returning its dense position.
     */
    pub fn remove(&mut self, a: BodyId, b: BodyId) -> Option<usize> {
        let (lo, hi) = ordered(a, b);
        self.maps.get_mut(lo).and_then(|map| map.remove(&hi))
    }


    /**
     * Iterate (neighbour, position) for the pairs whose lower id is `a`.
     */
    pub fn neighbours(&self, a: BodyId) -> impl Iterator<Item = (BodyId, usize)> + '_ {
        self.maps
            .get(a)
            .into_iter()
            .flat_map(|map| map.iter().map(|(&k, &p)| (k, p)))
    }


    pub fn clear(&mut self) {
        for map in &mut self.maps {
            map.clear()
        }
    }
}
