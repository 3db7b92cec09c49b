//! Community detection over an assembled graph

use kgfusion_core::{Community, CommunityDetector, Entity, EntityId, Relationship};
use std::collections::{BTreeMap, HashMap};

/// Connected components via union-find.
///
/// Deterministic: members are sorted by id and communities are numbered in
/// order of their smallest member id. Relationships whose endpoints are
/// not in the entity set are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectedComponents;

impl CommunityDetector for ConnectedComponents {
    fn detect(&self, entities: &[Entity], relationships: &[Relationship]) -> Vec<Community> {
        let mut ids: Vec<&EntityId> = entities.iter().map(|e| &e.id).collect();
        ids.sort();
        ids.dedup();
        let index: HashMap<&EntityId, usize> =
            ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut sets = DisjointSets::new(ids.len());
        for rel in relationships {
            if let (Some(&a), Some(&b)) = (index.get(&rel.source_id), index.get(&rel.target_id)) {
                sets.union(a, b);
            }
        }

        // Ids are sorted, so the first member seen for each root is its
        // smallest and BTreeMap keyed by that index orders communities.
        let mut groups: BTreeMap<usize, Vec<EntityId>> = BTreeMap::new();
        let mut first_of_root: HashMap<usize, usize> = HashMap::new();
        for (i, id) in ids.iter().enumerate() {
            let root = sets.find(i);
            let first = *first_of_root.entry(root).or_insert(i);
            groups.entry(first).or_default().push((*id).clone());
        }

        groups
            .into_values()
            .enumerate()
            .map(|(id, members)| Community { id, members })
            .collect()
    }
}

struct DisjointSets {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSets {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
            rank: vec![0; len],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgfusion_core::EntityOrigin;

    fn entity(name: &str) -> Entity {
        Entity::new(name, "concept", EntityOrigin::Extracted)
    }

    #[test]
    fn test_components() {
        let (a, b, c, d) = (entity("a"), entity("b"), entity("c"), entity("d"));
        let rels = vec![
            Relationship::new(a.id.clone(), "uses", b.id.clone()),
            Relationship::new(c.id.clone(), "uses", "missing"),
        ];
        let communities = ConnectedComponents.detect(&[a.clone(), b.clone(), c.clone(), d.clone()], &rels);

        assert_eq!(communities.len(), 3);
        let with_a = communities
            .iter()
            .find(|community| community.members.contains(&a.id))
            .unwrap();
        assert!(with_a.members.contains(&b.id));
        for (i, community) in communities.iter().enumerate() {
            assert_eq!(community.id, i);
            assert!(community.members.windows(2).all(|w| w[0] < w[1]));
        }
        // Ordered by smallest member id
        let firsts: Vec<&EntityId> = communities.iter().map(|c| &c.members[0]).collect();
        assert!(firsts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_deterministic_regardless_of_input_order() {
        let ents = vec![entity("x"), entity("y"), entity("z")];
        let rels = vec![Relationship::new(ents[0].id.clone(), "related_to", ents[2].id.clone())];
        let mut reversed = ents.clone();
        reversed.reverse();
        assert_eq!(
            ConnectedComponents.detect(&ents, &rels),
            ConnectedComponents.detect(&reversed, &rels)
        );
    }
}
