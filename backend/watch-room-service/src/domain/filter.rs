//! Small filter combinator over rooms.
//!
//! Backends interpret the tree themselves: the memory store calls
//! [`RoomFilter::matches`], the Postgres store compiles it into SQL.

use uuid::Uuid;

use super::room::Room;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomPredicate {
    HasViewer(Uuid),
    OwnedBy(Uuid),
    ForFilm(Uuid),
    IsClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomFilter {
    And(Vec<RoomFilter>),
    Or(Vec<RoomFilter>),
    Not(Box<RoomFilter>),
    Leaf(RoomPredicate),
}

impl RoomFilter {
    pub fn has_viewer(id: Uuid) -> Self {
        RoomFilter::Leaf(RoomPredicate::HasViewer(id))
    }

    pub fn owned_by(id: Uuid) -> Self {
        RoomFilter::Leaf(RoomPredicate::OwnedBy(id))
    }

    pub fn for_film(id: Uuid) -> Self {
        RoomFilter::Leaf(RoomPredicate::ForFilm(id))
    }

    pub fn is_closed() -> Self {
        RoomFilter::Leaf(RoomPredicate::IsClosed)
    }

    pub fn and(self, other: RoomFilter) -> Self {
        match self {
            RoomFilter::And(mut parts) => {
                parts.push(other);
                RoomFilter::And(parts)
            }
            first => RoomFilter::And(vec![first, other]),
        }
    }

    pub fn or(self, other: RoomFilter) -> Self {
        match self {
            RoomFilter::Or(mut parts) => {
                parts.push(other);
                RoomFilter::Or(parts)
            }
            first => RoomFilter::Or(vec![first, other]),
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        RoomFilter::Not(Box::new(self))
    }

    /// Empty `And` matches everything, empty `Or` matches nothing.
    pub fn matches(&self, room: &Room) -> bool {
        match self {
            RoomFilter::And(parts) => parts.iter().all(|f| f.matches(room)),
            RoomFilter::Or(parts) => parts.iter().any(|f| f.matches(room)),
            RoomFilter::Not(inner) => !inner.matches(room),
            RoomFilter::Leaf(predicate) => match predicate {
                RoomPredicate::HasViewer(id) => room.contains(*id),
                RoomPredicate::OwnedBy(id) => room.owner_id() == *id,
                RoomPredicate::ForFilm(id) => room.film_id() == *id,
                RoomPredicate::IsClosed => !room.is_open(),
            },
        }
    }
}
