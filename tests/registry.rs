use granular::body::BodyId;
use granular::interaction::{ContactGeometry, ContactPhysics};
use granular::interaction_container::InteractionContainer;
use granular::geometry::Vector3r;
use granular::parallel::WorkerPool;

const NUM_BODIES: usize = 40;

/// Small linear congruential generator, so runs are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn below(&mut self, n: usize) -> usize {
        (self.next() % n as u64) as usize
    }

    fn pair(&mut self) -> (BodyId, BodyId) {
        let a = self.below(NUM_BODIES);
        let b = (a + 1 + self.below(NUM_BODIES - 1)) % NUM_BODIES;
        (a, b)
    }
}

fn make_real(registry: &mut InteractionContainer, id1: BodyId, id2: BodyId) {
    if let Some(i) = registry.find_mut(id1, id2) {
        i.make_real(
            ContactGeometry {
                normal: Vector3r::x(),
                penetration_depth: 1e-3,
            },
            ContactPhysics {
                normal_force: Vector3r::zeros(),
                shear_force: Vector3r::zeros(),
            },
            0,
        )
    }
}

fn random_registry(seed: u64, ops: usize) -> InteractionContainer {
    let mut rng = Lcg(seed);
    let mut registry = InteractionContainer::with_body_count(NUM_BODIES);

    for _ in 0..ops {
        let (a, b) = rng.pair();
        match rng.below(4) {
            0 => {
                registry.erase(a, b, None);
            }
            1 => {
                registry.insert(a, b);
                make_real(&mut registry, a, b);
            }
            _ => {
                registry.insert(a, b);
            }
        }
    }
    registry
}

fn surviving_pairs(registry: &InteractionContainer) -> Vec<(BodyId, BodyId)> {
    let mut pairs: Vec<_> = registry.iter().map(|i| i.ordered_ids()).collect();
    pairs.sort_unstable();
    pairs
}




#[test]
fn registry_stays_consistent_under_random_inserts_and_erases() {
    let mut rng = Lcg(17);
    let mut registry = InteractionContainer::with_body_count(NUM_BODIES);
    let mut model = std::collections::BTreeSet::new();

    for _ in 0..2000 {
        let (a, b) = rng.pair();
        let key = (a.min(b), a.max(b));

        if rng.below(3) == 0 {
            assert_eq!(registry.erase(a, b, None), model.remove(&key));
            assert!(!registry.found(a, b));
        } else {
            assert_eq!(registry.insert(a, b), model.insert(key));
            assert!(registry.found(b, a));
        }
        assert_eq!(registry.len(), model.len());
        assert!(registry.is_consistent());
    }
    assert_eq!(surviving_pairs(&registry), model.into_iter().collect::<Vec<_>>());
}

#[test]
fn duplicate_and_reversed_inserts_are_no_ops() {
    let mut registry = InteractionContainer::with_body_count(8);
    assert!(registry.insert(2, 5));
    assert!(registry.insert(1, 5));
    assert!(!registry.insert(5, 1));
    assert_eq!(surviving_pairs(&registry), vec![(1, 5), (2, 5)]);
}

#[test]
fn erasing_absent_pair_leaves_registry_unchanged() {
    let mut registry = random_registry(3, 300);
    let before = surviving_pairs(&registry);
    let absent = (0..NUM_BODIES)
        .flat_map(|a| (a + 1..NUM_BODIES).map(move |b| (a, b)))
        .find(|&(a, b)| !registry.found(a, b))
        .unwrap();

    assert!(!registry.erase(absent.0, absent.1, None));
    assert_eq!(surviving_pairs(&registry), before);
    assert!(registry.is_consistent());
}

#[test]
fn conditional_erase_keeps_real_interactions() {
    let mut registry = InteractionContainer::with_body_count(8);
    registry.insert(1, 2);
    registry.insert(3, 4);
    make_real(&mut registry, 1, 2);

    let pool = WorkerPool::new(1).unwrap();
    assert_eq!(registry.conditionally_erase_non_real(&|_, _| true, &pool), 1);
    assert_eq!(registry.len(), 1);
    assert!(registry.found(2, 1));
    assert_eq!(registry.find(1, 2).unwrap().lin_ix(), 0);
    assert!(registry.is_consistent());
}

#[test]
fn parallel_and_serial_conditional_erase_agree() {
    let serial_pool = WorkerPool::new(1).unwrap();
    let parallel_pool = WorkerPool::new(4).unwrap();
    let predicate = |a: BodyId, b: BodyId| (a + 2 * b) % 3 != 0;

    for seed in 1..6 {
        let mut serial = random_registry(seed, 600);
        let mut parallel = random_registry(seed, 600);
        assert_eq!(surviving_pairs(&serial), surviving_pairs(&parallel));

        let erased_serial = serial.conditionally_erase_non_real(&predicate, &serial_pool);
        let erased_parallel = parallel.conditionally_erase_non_real(&predicate, &parallel_pool);

        assert_eq!(erased_serial, erased_parallel);
        assert_eq!(surviving_pairs(&serial), surviving_pairs(&parallel));
        assert!(serial.is_consistent());
        assert!(parallel.is_consistent());
    }
}

#[test]
fn sorted_snapshot_is_independent_of_insertion_history() {
    let mut forward = InteractionContainer::with_body_count(NUM_BODIES);
    let mut backward = InteractionContainer::with_body_count(NUM_BODIES);
    let pairs: Vec<_> = (0..30).map(|k| (k % 7 + 10, k)).filter(|(a, b)| a != b).collect();

    for &(a, b) in &pairs {
        forward.insert(a, b);
    }
    for &(a, b) in pairs.iter().rev() {
        backward.insert(b, a);
    }
    backward.insert(0, 39);
    backward.erase(39, 0, None);

    forward.update_sorted_intrs();
    backward.update_sorted_intrs();

    let ids = |r: &InteractionContainer| r.sorted_intrs().iter().map(|i| i.ordered_ids()).collect::<Vec<_>>();
    let mut expected = ids(&forward);
    expected.sort_unstable();
    assert_eq!(ids(&forward), expected);
    assert_eq!(ids(&forward), ids(&backward));

    let first = rmp_serde::to_vec(&ids(&forward)).unwrap();
    forward.update_sorted_intrs();
    assert_eq!(rmp_serde::to_vec(&ids(&forward)).unwrap(), first);
}
