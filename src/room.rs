//! Named groups of server sockets.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::socket::ParallelSocket;

/// Observes room activity on a server. Called on the server's event thread.
pub trait RoomHandler: Send + Sync {
    /// The first member joined `room`.
    fn on_created(&self, _room: &str) {}
    /// `socket` joined `room`.
    fn on_join(&self, _room: &str, _socket: &ParallelSocket) {}
    /// `socket` left `room`, explicitly or by disconnecting.
    fn on_leave(&self, _room: &str, _socket: &ParallelSocket) {}
    /// `data` was sent to the members of `room`.
    fn on_broadcast(&self, _room: &str, _data: &[u8]) {}
}

/// A snapshot of one room.
#[derive(Clone)]
pub struct Room {
    name: String,
    members: BTreeMap<Uuid, ParallelSocket>,
}

impl Room {
    fn new(name: &str) -> Room {
        Room {
            name: name.to_string(),
            members: BTreeMap::new(),
        }
    }

    /// Room name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Members ordered by GUID.
    pub fn members(&self) -> Vec<ParallelSocket> {
        self.members.values().cloned().collect()
    }

    /// Whether the socket with `guid` is a member.
    pub fn contains(&self, guid: &Uuid) -> bool {
        self.members.contains_key(guid)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false for a room obtained from a server.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// What a membership change did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Change {
    /// Nothing; already a member, or not one.
    None,
    /// Membership changed in an existing room.
    Member,
    /// The room was created by this join, or removed by this leave.
    Room,
}

/// Every room of a server. Empty rooms do not exist.
#[derive(Default)]
pub(crate) struct Rooms {
    rooms: BTreeMap<String, Room>,
}

impl Rooms {
    pub(crate) fn join(&mut self, name: &str, socket: &ParallelSocket) -> Change {
        let created = !self.rooms.contains_key(name);
        let room = self
            .rooms
            .entry(name.to_string())
            .or_insert_with(|| Room::new(name));
        if room.members.insert(socket.guid(), socket.clone()).is_some() {
            return Change::None;
        }
        if created { Change::Room } else { Change::Member }
    }

    pub(crate) fn leave(&mut self, name: &str, guid: &Uuid) -> (Change, Option<ParallelSocket>) {
        let Some(room) = self.rooms.get_mut(name) else {
            return (Change::None, None);
        };
        let Some(socket) = room.members.remove(guid) else {
            return (Change::None, None);
        };
        if room.is_empty() {
            self.rooms.remove(name);
            (Change::Room, Some(socket))
        } else {
            (Change::Member, Some(socket))
        }
    }

    /// Removes `guid` from every room. Returns the rooms it was in.
    pub(crate) fn leave_all(&mut self, guid: &Uuid) -> Vec<(String, ParallelSocket)> {
        let mut left = Vec::new();
        self.rooms.retain(|name, room| {
            if let Some(socket) = room.members.remove(guid) {
                left.push((name.clone(), socket));
            }
            !room.is_empty()
        });
        left
    }

    pub(crate) fn get(&self, name: &str) -> Option<&Room> {
        self.rooms.get(name)
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }

    pub(crate) fn names_of(&self, guid: &Uuid) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|(_, room)| room.contains(guid))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::packet::Packet;
    use crate::socket::SocketHandler;

    struct Quiet;

    impl SocketHandler for Quiet {
        fn on_received(&self, _socket: &ParallelSocket, _packet: Packet) {}
    }

    fn socket() -> ParallelSocket {
        ParallelSocket::detached(Arc::new(Quiet))
    }

    #[test]
    fn rooms_appear_with_their_first_member_and_go_with_their_last() {
        let (a, b) = (socket(), socket());
        let mut rooms = Rooms::default();
        assert_eq!(rooms.join("lobby", &a), Change::Room);
        assert_eq!(rooms.join("lobby", &b), Change::Member);
        assert_eq!(rooms.join("lobby", &b), Change::None);
        assert_eq!(rooms.get("lobby").map(Room::len), Some(2));

        assert_eq!(rooms.leave("lobby", &a.guid()).0, Change::Member);
        assert_eq!(rooms.leave("lobby", &a.guid()).0, Change::None);
        let (change, left) = rooms.leave("lobby", &b.guid());
        assert_eq!(change, Change::Room);
        assert!(left.is_some_and(|s| s.same_as(&b)));
        assert!(rooms.get("lobby").is_none());
        assert!(rooms.names().is_empty());

        a.abandon();
        b.abandon();
    }

    #[test]
    fn leave_all_drops_emptied_rooms_only() {
        let (a, b) = (socket(), socket());
        let mut rooms = Rooms::default();
        rooms.join("red", &a);
        rooms.join("blue", &a);
        rooms.join("blue", &b);
        assert_eq!(rooms.names_of(&a.guid()), vec!["blue", "red"]);

        let mut left: Vec<String> = rooms.leave_all(&a.guid()).into_iter().map(|(n, _)| n).collect();
        left.sort();
        assert_eq!(left, vec!["blue", "red"]);
        assert_eq!(rooms.names(), vec!["blue"]);
        let blue = rooms.get("blue").unwrap();
        assert!(blue.contains(&b.guid()) && !blue.contains(&a.guid()));

        a.abandon();
        b.abandon();
    }
}
