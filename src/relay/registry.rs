use std::collections::HashMap;

use mio::Token;

use super::connection::Connection;

/// Live set of upgraded connections, keyed by poll token. Owned by the
/// server and only ever touched from the dispatch thread, so there is no
/// locking discipline to get wrong.
#[derive(Default)]
pub struct ConnectionRegistry {
    conns: HashMap<Token, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection. Re-adding a token replaces the previous
    /// entry, so a broadcast can never deliver to the same token twice.
    pub fn add(&mut self, token: Token, conn: Connection) {
        self.conns.insert(token, conn);
    }

    /// Removes a connection. Removing an absent token is a no-op; both
    /// end-of-stream and a write error may race to remove the same entry.
    pub fn remove(&mut self, token: Token) -> Option<Connection> {
        self.conns.remove(&token)
    }

    pub fn contains(&self, token: Token) -> bool {
        self.conns.contains_key(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.conns.get_mut(&token)
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn values(&self) -> impl Iterator<Item = &Connection> {
        self.conns.values()
    }

    /// Visits every connection in unspecified order.
    pub fn for_each_mut(&mut self, mut visit: impl FnMut(Token, &mut Connection)) {
        for (token, conn) in self.conns.iter_mut() {
            visit(*token, conn);
        }
    }

    /// Removes every connection marked dead, returning them for teardown.
    pub fn sweep_dead(&mut self) -> Vec<(Token, Connection)> {
        let dead: Vec<Token> = self
            .conns
            .iter()
            .filter(|(_, conn)| conn.is_dead())
            .map(|(token, _)| *token)
            .collect();
        dead.into_iter()
            .filter_map(|token| self.conns.remove(&token).map(|conn| (token, conn)))
            .collect()
    }
}
