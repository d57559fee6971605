use core::cmp::Ordering;
use core::ops::Index;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{debug, error, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::adjacency::BodyAdjacency;
use crate::body::BodyId;
use crate::interaction::Interaction;
use crate::parallel::WorkerPool;




/**
 * Decides whether a non-real interaction is still spatially plausible. This
 * is implemented by the broad phase, which alone has the authority to forget
 * a candidate pair. Implementations are queried concurrently from worker
 * threads and must not mutate anything.
 */
pub trait ShouldErase {
    fn should_be_erased(&self, id1: BodyId, id2: BodyId) -> bool;
}

impl<F> ShouldErase for F
where
    F: Fn(BodyId, BodyId) -> bool,
{
    fn should_be_erased(&self, id1: BodyId, id2: BodyId) -> bool {
        self(id1, id2)
    }
}




/**
 * The registry of pairwise interactions. Interactions are stored in two
 * places that are kept in sync by `insert` and `erase`:
 *
 * - A dense sequence, allowing constant-time linear traversal. Each
 *   interaction records its position in this sequence (`lin_ix`).
 * - A per-body adjacency index, in the body with the smaller id, mapping the
 *   neighbour id to the dense position. This gives constant-time existence
 *   checks.
 *
 * The registry owns the interactions; the adjacency index only holds
 * positions. Removal swaps the last interaction into the freed slot, so
 * positions are not stable across erasures.
 */
pub struct InteractionContainer {
    lin_intrs: Vec<Interaction>,
    sorted_intrs: Vec<Interaction>,
    adjacency: BodyAdjacency,
    curr_size: usize,
    draw_mutex: Mutex<()>,

    /// Set when the collider's persistent data must be invalidated.
    pub dirty: bool,

    /// Persist interactions in (min id, max id) order rather than in
    /// insertion order.
    pub serialize_sorted: bool,

    /// Iteration at which the collider last ran, if it wants interactions
    /// not encountered in that step to be deleted by the interaction loop.
    pub iter_collider_last_run: Option<u64>,
}




// ============================================================================
impl InteractionContainer {


    pub fn new() -> Self {
        Self::default()
    }


    /**
     * Create an empty registry indexing `num_bodies` bodies.
     */
    pub fn with_body_count(num_bodies: usize) -> Self {
        let mut intrs = Self::new();
        intrs.set_body_count(num_bodies);
        intrs
    }


    /**
     * Set the bound on body ids. Must be called whenever the body container
     * grows or shrinks. Interactions referencing bodies beyond the new bound
     * are erased.
     */
    pub fn set_body_count(&mut self, num_bodies: usize) {
        if num_bodies < self.adjacency.num_bodies() {
            let stale: Vec<_> = self
                .lin_intrs
                .iter()
                .filter(|i| i.id1().max(i.id2()) >= num_bodies)
                .map(|i| (i.id1(), i.id2()))
                .collect();

            for (id1, id2) in stale {
                self.erase(id1, id2, None);
            }
        }
        self.adjacency.resize(num_bodies)
    }


    pub fn body_count(&self) -> usize {
        self.adjacency.num_bodies()
    }


    /**
     * Return the number of interactions, real and potential.
     */
    pub fn len(&self) -> usize {
        self.curr_size
    }


    pub fn is_empty(&self) -> bool {
        self.curr_size == 0
    }


    pub fn iter(&self) -> impl Iterator<Item = &Interaction> {
        self.lin_intrs.iter()
    }


    pub fn as_slice(&self) -> &[Interaction] {
        &self.lin_intrs
    }


    /**
     * Mutable access to the interaction at a dense position. The id pair is
     * not mutable, so the registry invariants are preserved.
     */
    pub fn get_mut(&mut self, pos: usize) -> Option<&mut Interaction> {
        self.lin_intrs.get_mut(pos)
    }


    /**
     * Create a potential interaction between two bodies. Returns false if the
     * pair is already present; nothing is created in that case.
     *
     * Panics if `id1 == id2` or if either id is outside the body bound.
     */
    pub fn insert(&mut self, id1: BodyId, id2: BodyId) -> bool {
        self.insert_interaction(Interaction::new(id1, id2))
    }


    /**
     * Insert an interaction built elsewhere, e.g. received from another rank.
     * Same rules as `insert`.
     */
    pub fn insert_interaction(&mut self, mut interaction: Interaction) -> bool {
        let (id1, id2) = (interaction.id1(), interaction.id2());
        let num_bodies = self.adjacency.num_bodies();

        assert!(id1 != id2, "body {} cannot interact with itself", id1);
        assert!(
            id1 < num_bodies && id2 < num_bodies,
            "interaction ({} {}) out of range for {} bodies",
            id1,
            id2,
            num_bodies
        );

        if !self.adjacency.insert(id1, id2, self.curr_size) {
            debug!("interaction ({} {}) already present", id1, id2);
            return false;
        }
        interaction.lin_ix = self.curr_size;
        self.lin_intrs.push(interaction);
        self.curr_size += 1;
        true
    }


    /**
     * Remove the interaction between two bodies from both the adjacency
     * index and the dense sequence. The last interaction of the sequence is
     * moved into the freed slot. If the caller already knows the dense
     * position it may pass it as `lin_pos`. Returns false if the pair is not
     * present.
     */
    pub fn erase(&mut self, id1: BodyId, id2: BodyId, lin_pos: Option<usize>) -> bool {
        if id1.max(id2) >= self.adjacency.num_bodies() {
            error!(
                "erase ({} {}) out of range for {} bodies",
                id1,
                id2,
                self.adjacency.num_bodies()
            );
            return false;
        }
        let pos = match self.adjacency.remove(id1, id2) {
            Some(pos) => pos,
            None => return false,
        };
        if let Some(lin_pos) = lin_pos {
            debug_assert_eq!(lin_pos, pos, "stale dense position for ({} {})", id1, id2);
        }

        let last = self.curr_size - 1;
        self.lin_intrs.swap(pos, last);
        self.lin_intrs.pop();
        self.curr_size -= 1;

        if pos != last {
            let moved = &mut self.lin_intrs[pos];
            moved.lin_ix = pos;
            let (a, b) = (moved.id1(), moved.id2());
            self.adjacency.relocate(a, b, pos);
        }
        true
    }


    /**
     * Constant-time existence check. A body cannot interact with itself, and
     * ids beyond the body bound are never found.
     */
    pub fn found(&self, id1: BodyId, id2: BodyId) -> bool {
        if id1 == id2 || id1.max(id2) >= self.adjacency.num_bodies() {
            false
        } else {
            self.adjacency.contains(id1, id2)
        }
    }


    pub fn find(&self, id1: BodyId, id2: BodyId) -> Option<&Interaction> {
        self.adjacency
            .get(id1, id2)
            .map(move |pos| &self.lin_intrs[pos])
    }


    pub fn find_mut(&mut self, id1: BodyId, id2: BodyId) -> Option<&mut Interaction> {
        match self.adjacency.get(id1, id2) {
            Some(pos) => self.lin_intrs.get_mut(pos),
            None => None,
        }
    }


    /**
     * Iterate the interactions stored on body `id`'s side of the index,
     * i.e. those whose other endpoint has a larger id.
     */
    pub fn neighbours(&self, id: BodyId) -> impl Iterator<Item = (BodyId, &Interaction)> {
        self.adjacency
            .neighbours(id)
            .map(move |(other, pos)| (other, &self.lin_intrs[pos]))
    }


    /**
     * Iterate every interaction involving body `id`. This is a linear scan.
     */
    pub fn interactions_of(&self, id: BodyId) -> impl Iterator<Item = &Interaction> {
        self.lin_intrs
            .iter()
            .filter(move |i| i.id1() == id || i.id2() == id)
    }


    /**
     * Reset an interaction to the potential state. It stays in the registry
     * until the collider decides whether to keep it as a candidate or to
     * erase it. Returns false if the pair is not present.
     */
    pub fn request_erase(&mut self, id1: BodyId, id2: BodyId) -> bool {
        match self.find_mut(id1, id2) {
            Some(i) => {
                i.reset();
                true
            }
            None => false,
        }
    }


    /**
     * Same as `request_erase`, keyed on the dense position.
     */
    pub fn request_erase_at(&mut self, pos: usize) -> bool {
        match self.lin_intrs.get_mut(pos) {
            Some(i) => {
                i.reset();
                true
            }
            None => false,
        }
    }


    /**
     * Erase every non-real interaction for which the predicate says the pair
     * is no longer plausible, and return how many were erased.
     *
     * With a single worker this is one pass over the dense sequence; after
     * an erase at position `p` the former last element sits at `p`, so the
     * scan does not advance. With several workers the candidates are
     * collected read-only into per-worker buffers, then erased sequentially
     * from the highest dense position down, so that no swap invalidates a
     * position recorded for a later erase.
     */
    pub fn conditionally_erase_non_real<P>(&mut self, predicate: &P, pool: &WorkerPool) -> usize
    where
        P: ShouldErase + Sync,
    {
        let init_size = self.curr_size;

        if pool.num_threads() <= 1 {
            let mut pos = 0;
            while pos < self.curr_size {
                let i = &self.lin_intrs[pos];
                let (id1, id2) = (i.id1(), i.id2());
                if !i.is_real() && predicate.should_be_erased(id1, id2) {
                    self.erase(id1, id2, Some(pos));
                } else {
                    pos += 1;
                }
            }
        } else {
            let intrs = &self.lin_intrs;
            let to_erase = pool.scan_static(self.curr_size, |pos, buffer| {
                let i = &intrs[pos];
                if !i.is_real() && predicate.should_be_erased(i.id1(), i.id2()) {
                    buffer.push((i.id1(), i.id2(), pos))
                }
            });

            for buffer in to_erase.iter().rev() {
                for &(id1, id2, pos) in buffer.iter().rev() {
                    self.erase(id1, id2, Some(pos));
                }
            }
        }
        init_size - self.curr_size
    }


    /**
     * Erase all non-real interactions.
     */
    pub fn erase_non_real(&mut self) -> usize {
        let init_size = self.curr_size;
        let mut pos = 0;
        while pos < self.curr_size {
            let i = &self.lin_intrs[pos];
            if !i.is_real() {
                let (id1, id2) = (i.id1(), i.id2());
                self.erase(id1, id2, Some(pos));
            } else {
                pos += 1;
            }
        }
        init_size - self.curr_size
    }


    /**
     * Drop all interactions.
     */
    pub fn clear(&mut self) {
        let _guard = self.draw_mutex.lock().unwrap_or_else(PoisonError::into_inner);
        self.adjacency.clear();
        self.lin_intrs.clear();
        self.sorted_intrs.clear();
        self.curr_size = 0;
        self.dirty = true;
    }


    /**
     * Refresh the sorted snapshot, ordered by (min id, max id). The dense
     * sequence's order depends on insertion and erasure history; this one
     * does not.
     */
    pub fn update_sorted_intrs(&mut self) {
        self.sorted_intrs = self.lin_intrs.clone();
        self.sorted_intrs.sort_by(compare_two_interactions);
    }


    pub fn sorted_intrs(&self) -> &[Interaction] {
        &self.sorted_intrs
    }


    /**
     * Lock held by a render pass while it traverses the registry. The
     * simulation step does not take it.
     */
    pub fn draw_guard(&self) -> MutexGuard<'_, ()> {
        self.draw_mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }


    /**
     * Verify that the dense sequence and the adjacency index agree. Used by
     * tests and debug assertions.
     */
    pub fn is_consistent(&self) -> bool {
        self.curr_size == self.lin_intrs.len()
            && self.adjacency.len() == self.curr_size
            && self.lin_intrs.iter().enumerate().all(|(pos, i)| {
                i.lin_ix() == pos && self.adjacency.get(i.id1(), i.id2()) == Some(pos)
            })
    }
}




// ============================================================================
/**
 * Total order over interactions by (min id, max id).
 */
pub fn compare_two_interactions(a: &Interaction, b: &Interaction) -> Ordering {
    a.ordered_ids().cmp(&b.ordered_ids())
}

impl Default for InteractionContainer {
    fn default() -> Self {
        Self {
            lin_intrs: Vec::new(),
            sorted_intrs: Vec::new(),
            adjacency: BodyAdjacency::new(),
            curr_size: 0,
            draw_mutex: Mutex::new(()),
            dirty: false,
            serialize_sorted: false,
            iter_collider_last_run: None,
        }
    }
}

impl Index<usize> for InteractionContainer {
    type Output = Interaction;

    fn index(&self, pos: usize) -> &Interaction {
        &self.lin_intrs[pos]
    }
}




// ============================================================================
#[derive(Serialize)]
struct SavedInteractionsRef<'a> {
    interactions: Vec<&'a Interaction>,
    serialize_sorted: bool,
    dirty: bool,
}

#[derive(Deserialize)]
struct SavedInteractions {
    interactions: Vec<Interaction>,
    serialize_sorted: bool,
    dirty: bool,
}

impl Serialize for InteractionContainer {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut interactions: Vec<_> = self.lin_intrs.iter().collect();

        if self.serialize_sorted {
            interactions.sort_by(|a, b| compare_two_interactions(a, b));
        }
        SavedInteractionsRef {
            interactions,
            serialize_sorted: self.serialize_sorted,
            dirty: self.dirty,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for InteractionContainer {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let saved = SavedInteractions::deserialize(deserializer)?;
        let num_bodies = saved
            .interactions
            .iter()
            .map(|i| i.id1().max(i.id2()) + 1)
            .max()
            .unwrap_or(0);

        let mut intrs = Self::with_body_count(num_bodies);
        intrs.serialize_sorted = saved.serialize_sorted;
        intrs.dirty = saved.dirty;

        for i in saved.interactions {
            if i.id1() == i.id2() {
                warn!("dropping self-interaction of body {} on load", i.id1());
                continue;
            }
            intrs.insert_interaction(i);
        }
        Ok(intrs)
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::InteractionContainer;
    use crate::geometry::Vector3r;
    use crate::interaction::{ContactGeometry, ContactPhysics, Interaction};
    use crate::parallel::WorkerPool;

    fn make_real(intrs: &mut InteractionContainer, id1: usize, id2: usize) {
        let geom = ContactGeometry {
            normal: Vector3r::x(),
            penetration_depth: 0.01,
        };
        let phys = ContactPhysics {
            normal_force: Vector3r::zeros(),
            shear_force: Vector3r::zeros(),
        };
        intrs.find_mut(id1, id2).unwrap().make_real(geom, phys, 0);
    }


    #[test]
    fn unordered_duplicate_insert_is_a_no_op() {
        let mut intrs = InteractionContainer::with_body_count(8);
        assert!(intrs.insert(2, 5));
        assert!(intrs.insert(1, 5));
        assert!(!intrs.insert(5, 1));
        assert_eq!(intrs.len(), 2);
        assert!(intrs.found(1, 5));
        assert!(intrs.found(5, 2));
        assert!(intrs.is_consistent());
    }


    #[test]
    fn erase_swaps_last_into_freed_slot() {
        let mut intrs = InteractionContainer::with_body_count(8);
        intrs.insert(0, 1);
        intrs.insert(2, 3);
        intrs.insert(4, 5);
        assert!(intrs.erase(1, 0, None));
        assert_eq!(intrs.len(), 2);
        assert_eq!(intrs[0].ordered_ids(), (4, 5));
        assert_eq!(intrs[0].lin_ix(), 0);
        assert!(intrs.is_consistent());
    }


    #[test]
    fn erase_of_absent_pair_returns_false() {
        let mut intrs = InteractionContainer::with_body_count(4);
        intrs.insert(0, 1);
        assert!(!intrs.erase(2, 3, None));
        assert!(!intrs.erase(0, 9, None));
        assert_eq!(intrs.len(), 1);
        assert!(intrs.erase(0, 1, None));
        assert!(!intrs.found(0, 1));
        assert!(!intrs.erase(0, 1, None));
    }


    #[test]
    fn found_rejects_self_and_out_of_range() {
        let mut intrs = InteractionContainer::with_body_count(3);
        intrs.insert(0, 2);
        assert!(!intrs.found(2, 2));
        assert!(!intrs.found(0, 3));
        assert!(intrs.found(2, 0));
    }


    #[test]
    #[should_panic]
    fn insert_out_of_range_panics() {
        let mut intrs = InteractionContainer::with_body_count(3);
        intrs.insert(0, 3);
    }


    #[test]
    fn request_erase_resets_without_removing() {
        let mut intrs = InteractionContainer::with_body_count(3);
        intrs.insert(0, 1);
        make_real(&mut intrs, 0, 1);
        assert!(intrs.find(0, 1).unwrap().is_real());
        assert!(intrs.request_erase(1, 0));
        assert!(!intrs.find(0, 1).unwrap().is_real());
        assert_eq!(intrs.len(), 1);
        assert!(!intrs.request_erase(1, 2));
    }


    #[test]
    fn request_erase_at_resets_by_dense_position() {
        let mut intrs = InteractionContainer::with_body_count(4);
        intrs.insert(0, 1);
        intrs.insert(2, 3);
        make_real(&mut intrs, 2, 3);
        let pos = intrs.find(3, 2).unwrap().lin_ix();
        assert!(intrs.request_erase_at(pos));
        assert!(!intrs[pos].is_real());
        assert!(intrs.found(2, 3));
        assert!(!intrs.request_erase_at(intrs.len()));
        assert_eq!(intrs.len(), 2);
    }


    #[test]
    fn erase_non_real_removes_potential_pairs_only() {
        let mut intrs = InteractionContainer::with_body_count(6);
        intrs.insert(0, 1);
        intrs.insert(1, 2);
        intrs.insert(2, 3);
        intrs.insert(4, 5);
        make_real(&mut intrs, 1, 2);
        make_real(&mut intrs, 4, 5);
        assert_eq!(intrs.erase_non_real(), 2);
        assert_eq!(intrs.len(), 2);
        assert!(intrs.found(2, 1));
        assert!(intrs.found(5, 4));
        assert!(!intrs.found(0, 1));
        assert!(intrs.iter().all(Interaction::is_real));
        assert!(intrs.is_consistent());
        assert_eq!(intrs.erase_non_real(), 0);
    }


    #[test]
    fn draw_guard_wraps_a_traversal() {
        let mut intrs = InteractionContainer::with_body_count(3);
        intrs.insert(0, 1);
        intrs.insert(1, 2);
        {
            let _guard = intrs.draw_guard();
            assert_eq!(intrs.iter().count(), 2);
        }
        // released, so clear can take it
        intrs.clear();
        let _guard = intrs.draw_guard();
        assert!(intrs.is_empty());
    }


    #[test]
    fn conditional_erase_keeps_real_interactions() {
        for threads in [1, 3] {
            let pool = WorkerPool::new(threads).unwrap();
            let mut intrs = InteractionContainer::with_body_count(5);
            intrs.insert(1, 2);
            intrs.insert(3, 4);
            make_real(&mut intrs, 1, 2);

            let erased = intrs.conditionally_erase_non_real(&|_: usize, _: usize| true, &pool);
            assert_eq!(erased, 1);
            assert_eq!(intrs.len(), 1);
            assert!(intrs.found(1, 2));
            assert_eq!(intrs[0].ordered_ids(), (1, 2));
            assert!(intrs.is_consistent());
        }
    }


    #[test]
    fn serial_conditional_erase_re_examines_swapped_slot() {
        let pool = WorkerPool::new(1).unwrap();
        let mut intrs = InteractionContainer::with_body_count(10);
        for k in 0..9 {
            intrs.insert(k, k + 1);
        }
        let erased = intrs.conditionally_erase_non_real(&|a: usize, _: usize| a % 2 == 0, &pool);
        assert_eq!(erased, 5);
        assert!(intrs.iter().all(|i| i.ordered_ids().0 % 2 == 1));
        assert!(intrs.is_consistent());
    }


    #[test]
    fn set_body_count_drops_interactions_beyond_bound() {
        let mut intrs = InteractionContainer::with_body_count(6);
        intrs.insert(0, 1);
        intrs.insert(4, 5);
        intrs.set_body_count(5);
        assert_eq!(intrs.len(), 1);
        assert!(intrs.is_consistent());
    }


    #[test]
    fn clear_empties_and_marks_dirty() {
        let mut intrs = InteractionContainer::with_body_count(4);
        intrs.insert(0, 1);
        intrs.insert(2, 1);
        intrs.clear();
        assert!(intrs.is_empty());
        assert!(intrs.dirty);
        assert!(intrs.insert(0, 1));
    }


    #[test]
    fn sorted_serialization_is_history_independent() {
        let mut a = InteractionContainer::with_body_count(6);
        a.insert(3, 4);
        a.insert(0, 5);
        a.insert(2, 1);
        a.insert(1, 0);
        a.serialize_sorted = true;

        let mut b = InteractionContainer::with_body_count(6);
        b.insert(1, 0);
        b.insert(3, 4);
        b.insert(2, 1);
        b.insert(0, 5);
        b.erase(4, 3, None);
        b.insert(3, 4);
        b.serialize_sorted = true;

        let mut bytes_a = Vec::new();
        let mut bytes_b = Vec::new();
        ciborium::ser::into_writer(&a, &mut bytes_a).unwrap();
        ciborium::ser::into_writer(&b, &mut bytes_b).unwrap();
        assert_eq!(bytes_a, bytes_b);

        let restored: InteractionContainer = ciborium::de::from_reader(&bytes_a[..]).unwrap();
        assert_eq!(restored.len(), 4);
        assert!(restored.serialize_sorted);
        assert!(restored.found(0, 5));
        assert!(restored.is_consistent());
        let pairs: Vec<_> = restored.iter().map(Interaction::ordered_ids).collect();
        assert_eq!(pairs, vec![(0, 1), (0, 5), (1, 2), (3, 4)]);
    }
}
