use std::collections::HashSet;

use log::{debug, error, info};
use serde::{Deserialize, Serialize};

use super::Subdomain;
use crate::body::{Body, BodyId};
use crate::error::{Error, Result};
use crate::interaction::Interaction;
use crate::message::{Communicator, Tag};
use crate::scene::Scene;

/// Tag of migrating bodies.
pub const TAG_BODY: Tag = 111;

/// Tag of ghost copies refreshed after a partition rebuild.
pub const TAG_GHOST: Tag = 112;

/// Tag of bodies shipped to the master by `merge_op`.
pub const TAG_MERGE: Tag = 420;

/// The master rank of `merge_op`.
pub const MASTER: usize = 0;




/**
 * Full body records in transit between ranks, with the interactions that
 * involve them. Encoded as CBOR; the receiver probes for the size first.
 */
#[derive(Serialize, Deserialize)]
pub struct MigrationPacket {
    pub sender: usize,
    pub bodies: Vec<Body>,
    pub interactions: Vec<Interaction>,
}




// ============================================================================
impl MigrationPacket {

    /**
     * Collect the listed bodies and every interaction touching one of them.
     * Fails without collecting anything if a listed body is absent.
     */
    pub fn collect(sender: usize, scene: &Scene, ids: &[BodyId]) -> Result<Self> {
        let bodies = ids
            .iter()
            .map(|&id| scene.bodies.get(id).cloned().ok_or(Error::MissingBody(id)))
            .collect::<Result<Vec<_>>>()?;

        let listed: HashSet<_> = ids.iter().copied().collect();
        let interactions = scene
            .interactions
            .iter()
            .filter(|i| listed.contains(&i.id1()) || listed.contains(&i.id2()))
            .cloned()
            .collect();

        Ok(Self {
            sender,
            bodies,
            interactions,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes).map_err(|e| Error::Codec(e.to_string()))?;
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}




// ============================================================================
impl Subdomain {

    /**
     * Ship the listed owned bodies to `receiver`, then delete them (and
     * their interactions) here. The ids must all be present; if one is not,
     * nothing is sent or deleted.
     */
    pub fn send_bodies<C: Communicator>(
        &mut self,
        comm: &C,
        scene: &mut Scene,
        receiver: usize,
        ids: &[BodyId],
    ) -> Result<()> {
        self.check_peer(receiver)?;
        let packet = MigrationPacket::collect(self.rank, scene, ids)?;
        comm.send(receiver, TAG_BODY, packet.encode()?)?;

        for &id in ids {
            scene.erase_body(id);
        }
        let sent: HashSet<_> = ids.iter().copied().collect();
        self.ids.retain(|id| !sent.contains(id));

        if !ids.is_empty() {
            debug!("subdomain {}: sent {} bodies to rank {}", self.rank, ids.len(), receiver);
        }
        Ok(())
    }

    /**
     * Receive the bodies `sender` shipped with `send_bodies` and take
     * ownership of them. Returns their ids. A malformed packet is an error
     * and nothing is inserted.
     */
    pub fn receive_bodies<C: Communicator>(
        &mut self,
        comm: &C,
        scene: &mut Scene,
        sender: usize,
    ) -> Result<Vec<BodyId>> {
        self.check_peer(sender)?;
        let packet = self.recv_packet(comm, sender, TAG_BODY)?;
        let mut received = Vec::with_capacity(packet.bodies.len());

        for mut body in packet.bodies {
            body.subdomain = self.rank;
            received.push(body.id);
            if !self.ids.contains(&body.id) {
                self.ids.push(body.id);
            }
            scene.insert_body_at(body);
        }
        adopt_interactions(scene, packet.interactions, None);
        Ok(received)
    }

    /**
     * Send ghost copies of `intersections[r]` to every peer `r`, insert the
     * copies the peers send, and drop local copies of foreign bodies that
     * are no longer in any receive table. Collective.
     */
    pub(crate) fn refresh_ghosts<C: Communicator>(&mut self, comm: &C, scene: &mut Scene) -> Result<()> {
        for r in self.peers() {
            let packet = MigrationPacket::collect(self.rank, scene, &self.intersections[r])?;
            comm.send(r, TAG_GHOST, packet.encode()?)?;
        }
        let peers: Vec<_> = self.peers().collect();
        for r in peers {
            let packet = self.recv_packet(comm, r, TAG_GHOST)?;
            for mut body in packet.bodies {
                body.subdomain = r;
                scene.insert_body_at(body);
            }
            adopt_interactions(scene, packet.interactions, Some(self.rank));
        }

        let mirrored: HashSet<_> = self.mirror_intersections.iter().flatten().copied().collect();
        let stale: Vec<_> = scene
            .bodies
            .iter()
            .filter(|b| b.subdomain != self.rank && !b.is_fluid_domain() && !mirrored.contains(&b.id))
            .map(|b| b.id)
            .collect();

        for id in stale {
            scene.erase_body(id);
        }
        Ok(())
    }

    /**
     * Gather every rank's owned bodies on the master. Workers send their
     * owned bodies and interactions; the master overwrites its copies.
     * Afterwards every rank re-derives `ids` from the body owners, drops
     * interactions it has no business holding, and re-derives
     * `intersections` from the last known peer boxes. Collective.
     */
    pub fn merge_op<C: Communicator>(&mut self, comm: &C, scene: &mut Scene) -> Result<()> {
        if self.rank == MASTER {
            for r in 1..self.comm_size {
                let packet = self.recv_packet(comm, r, TAG_MERGE)?;
                let count = packet.bodies.len();
                for mut body in packet.bodies {
                    body.subdomain = r;
                    scene.insert_body_at(body);
                }
                adopt_interactions(scene, packet.interactions, None);
                debug!("master merged {} bodies from rank {}", count, r);
            }
        } else {
            let owned: Vec<_> = self.ids.iter().copied().filter(|&id| scene.bodies.exists(id)).collect();
            let packet = MigrationPacket::collect(self.rank, scene, &owned)?;
            comm.send(MASTER, TAG_MERGE, packet.encode()?)?;
        }

        self.rederive_ids(&scene.bodies);
        let pruned = self.prune_interactions(scene);
        self.update_intersections(&scene.bodies);

        info!(
            "subdomain {}: merged, {} owned bodies, {} interactions pruned",
            self.rank,
            self.ids.len(),
            pruned
        );
        Ok(())
    }

    /**
     * Erase interactions with a missing endpoint. Workers also erase those
     * whose endpoints are both foreign; the master keeps them, since it
     * holds the merged scene.
     */
    fn prune_interactions(&self, scene: &mut Scene) -> usize {
        let keep_foreign = self.rank == MASTER;
        let bodies = &scene.bodies;
        let rank = self.rank;

        let doomed: Vec<_> = scene
            .interactions
            .iter()
            .filter(|i| match (bodies.get(i.id1()), bodies.get(i.id2())) {
                (Some(a), Some(b)) => !keep_foreign && a.subdomain != rank && b.subdomain != rank,
                _ => true,
            })
            .map(|i| (i.id1(), i.id2()))
            .collect();

        for &(id1, id2) in &doomed {
            scene.interactions.erase(id1, id2, None);
        }
        doomed.len()
    }

    fn recv_packet<C: Communicator>(&self, comm: &C, sender: usize, tag: Tag) -> Result<MigrationPacket> {
        let size = comm.probe(sender, tag)?;
        let bytes = comm.recv(sender, tag)?;

        if bytes.len() != size {
            error!(
                "subdomain {}: probed {} bytes from rank {} but received {}",
                self.rank,
                size,
                sender,
                bytes.len()
            );
            return Err(Error::LengthMismatch {
                context: "body packet",
                expected: size,
                actual: bytes.len(),
            });
        }
        let packet = MigrationPacket::decode(&bytes).map_err(|e| {
            error!("subdomain {}: malformed body packet from rank {}: {}", self.rank, sender, e);
            e
        })?;
        if packet.sender != sender {
            error!(
                "subdomain {}: body packet from rank {} claims to come from rank {}",
                self.rank, sender, packet.sender
            );
            return Err(Error::Codec(format!(
                "packet sender {} does not match source rank {}",
                packet.sender, sender
            )));
        }
        Ok(packet)
    }
}

/**
 * Insert received interactions whose endpoints are both present. An
 * interaction that already exists takes the received geometry and physics,
 * unless `keep_owned` names the local rank and one of its endpoints is owned
 * here: the owner's copy of such an interaction is authoritative.
 */
fn adopt_interactions(scene: &mut Scene, interactions: Vec<Interaction>, keep_owned: Option<usize>) {
    scene.sync_body_count();

    for interaction in interactions {
        let (id1, id2) = (interaction.id1(), interaction.id2());
        let (b1, b2) = match (scene.bodies.get(id1), scene.bodies.get(id2)) {
            (Some(b1), Some(b2)) => (b1, b2),
            _ => continue,
        };
        let owned_here = keep_owned.map_or(false, |rank| b1.subdomain == rank || b2.subdomain == rank);

        if let Some(existing) = scene.interactions.find_mut(id1, id2) {
            if owned_here {
                continue;
            }
            existing.geom = interaction.geom;
            existing.phys = interaction.phys;
            existing.iter_made_real = interaction.iter_made_real;
            existing.iter_last_seen = interaction.iter_last_seen;
        } else {
            scene.interactions.insert_interaction(interaction);
        }
    }
}




// ============================================================================
#[cfg(test)]
mod test {

    use super::{adopt_interactions, MigrationPacket};
    use crate::body::Body;
    use crate::geometry::Vector3r;
    use crate::interaction::{ContactGeometry, ContactPhysics, Interaction};
    use crate::parallel::WorkerPool;
    use crate::scene::Scene;

    fn real(id1: usize, id2: usize, depth: f64, iter: u64) -> Interaction {
        let mut i = Interaction::new(id1, id2);
        let geom = ContactGeometry {
            normal: Vector3r::x(),
            penetration_depth: depth,
        };
        let phys = ContactPhysics {
            normal_force: Vector3r::zeros(),
            shear_force: Vector3r::zeros(),
        };
        i.make_real(geom, phys, iter);
        i
    }

    /// Body 0 is owned by rank 0; bodies 1 to 3 are ghosts of rank 1.
    fn boundary_scene() -> Scene {
        let mut scene = Scene::new(0, 1e-3, WorkerPool::new(1).unwrap());
        for k in 0..4 {
            let mut body = Body::sphere(k, Vector3r::new(k as f64, 0.0, 0.0), 0.6);
            body.subdomain = if k == 0 { 0 } else { 1 };
            scene.insert_body_at(body);
        }
        scene.interactions.insert_interaction(real(0, 1, 0.1, 3));
        scene.interactions.insert(2, 3);
        scene
    }

    fn depth(scene: &Scene, id1: usize, id2: usize) -> Option<f64> {
        let i = scene.interactions.find(id1, id2)?;
        i.geom.as_ref().map(|g| g.penetration_depth)
    }

    #[test]
    fn ghost_interactions_do_not_overwrite_owned_contacts() {
        let mut scene = boundary_scene();
        let received = vec![real(1, 0, 0.5, 7), real(2, 3, 0.2, 7), real(1, 2, 0.3, 7)];
        adopt_interactions(&mut scene, received, Some(0));

        assert_eq!(depth(&scene, 0, 1), Some(0.1));
        assert_eq!(scene.interactions.find(0, 1).unwrap().iter_made_real, Some(3));
        assert_eq!(depth(&scene, 2, 3), Some(0.2));
        assert_eq!(depth(&scene, 1, 2), Some(0.3));
        assert_eq!(scene.interactions.len(), 3);
        assert!(scene.interactions.is_consistent());
    }

    #[test]
    fn migrated_interactions_replace_the_local_copy() {
        let mut scene = boundary_scene();
        adopt_interactions(&mut scene, vec![real(0, 1, 0.5, 7), real(0, 9, 0.5, 7)], None);
        assert_eq!(depth(&scene, 0, 1), Some(0.5));
        assert_eq!(scene.interactions.len(), 2);
    }

    #[test]
    fn packet_collects_bodies_and_their_interactions() {
        let mut scene = Scene::new(0, 1e-3, WorkerPool::new(1).unwrap());
        for k in 0..4 {
            scene.insert_body(Body::sphere(0, Vector3r::new(k as f64, 0.0, 0.0), 0.5));
        }
        scene.interactions.insert(0, 1);
        scene.interactions.insert(2, 3);
        scene.interactions.insert(1, 3);

        let packet = MigrationPacket::collect(0, &scene, &[1]).unwrap();
        assert_eq!(packet.bodies.len(), 1);
        assert_eq!(packet.interactions.len(), 2);

        let decoded = MigrationPacket::decode(&packet.encode().unwrap()).unwrap();
        assert_eq!(decoded.bodies[0].id, 1);
        assert_eq!(decoded.bodies[0].state, packet.bodies[0].state);
        assert!(MigrationPacket::collect(0, &scene, &[1, 9]).is_err());
        assert!(MigrationPacket::decode(&[0xff, 0x00]).is_err());
    }
}
