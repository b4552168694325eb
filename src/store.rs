//! The local materialized state store, backed by SQLite.
//!
//! Each replica owns one database file holding the chat domain tables (users,
//! contacts, messages) and the ip table used for client steering. The store
//! only provides atomic execution of single commands and simple queries;
//! keeping replicas consistent is the replication engine's job, not the
//! store's. Writes always go through [`Store::execute`] with a parameterized
//! statement and a scalar argument vector, since that pair is exactly what
//! gets recorded in the command log and replayed on backups.

use crate::error::Result;
use crate::{errdata, errinput};

use log::debug;
use rusqlite::{params_from_iter, Connection};
use serde_derive::{Deserialize, Serialize};
use std::path::Path;

/// Statement creating the users table.
const CREATE_USERS: &str = "CREATE TABLE users (
    userid INTEGER PRIMARY KEY,
    password TEXT,
    email TEXT UNIQUE,
    firstname TEXT,
    lastname TEXT,
    descr TEXT)";

/// Statement creating the contacts table.
const CREATE_CONTACTS: &str = "CREATE TABLE contacts (
    rec_id INTEGER PRIMARY KEY,
    userid INTEGER,
    contactid INTEGER)";

/// Statement creating the messages table.
const CREATE_MESSAGES: &str = "CREATE TABLE messages (
    rec_id INTEGER PRIMARY KEY,
    from_userid INTEGER,
    to_userid INTEGER,
    message TEXT,
    timestamp TEXT,
    acked INTEGER)";

/// Statement creating the ip table. The primary key suppresses duplicate
/// client addresses.
const CREATE_IP: &str = "CREATE TABLE ip (addr TEXT PRIMARY KEY)";

/// The replicated command inserting a new user.
pub const INSERT_USER: &str = "INSERT INTO users
    (password, email, firstname, lastname, descr) VALUES (?, ?, ?, ?, ?)";

/// The replicated command inserting one direction of a contact pair.
pub const INSERT_CONTACT: &str = "INSERT INTO contacts (userid, contactid) VALUES (?, ?)";

/// The replicated command inserting a chat message.
pub const INSERT_MESSAGE: &str = "INSERT INTO messages
    (from_userid, to_userid, message, timestamp, acked) VALUES (?, ?, ?, ?, ?)";

/// A scalar command argument.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, ValueRef};
        Ok(match self {
            Value::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            Value::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

/// A user profile, as returned to clients after registration or login and by
/// the contact listings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: i64,
    pub email: String,
    pub firstname: String,
    pub lastname: String,
    pub descr: String,
}

/// A chat message between two users. The timestamp is an opaque display
/// string chosen by the sender.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
    pub timestamp: String,
    pub from: i64,
    pub to: i64,
    pub acked: i64,
}

/// A new-account request. The password is already hashed by the gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub email: String,
    pub password: String,
    pub firstname: String,
    pub lastname: String,
    pub descr: String,
}

/// Login credentials. The password is already hashed by the gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

/// The materialized state store of a single replica.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens the database at the given path, creating it with the schema if
    /// it does not exist yet.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let exists = path.as_ref().try_exists()?;
        let conn = Connection::open(path)?;
        let store = Store { conn };
        if !exists {
            store.create_schema()?;
        }
        Ok(store)
    }

    /// Opens an in-memory database with the schema, for tests.
    pub fn open_memory() -> Result<Self> {
        let store = Store { conn: Connection::open_in_memory()? };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<()> {
        for statement in [CREATE_USERS, CREATE_CONTACTS, CREATE_MESSAGES, CREATE_IP] {
            self.conn.execute(statement, ())?;
        }
        Ok(())
    }

    /// Atomically executes a single parameterized command, returning the last
    /// inserted row ID. This is the application primitive for both
    /// client-driven writes on the leader and replicated entries on backups.
    pub fn execute(&self, sql: &str, args: &[Value]) -> Result<i64> {
        self.conn.execute(sql, params_from_iter(args.iter()))?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Verifies credentials and returns the matching profile.
    pub fn login(&self, credentials: &Credentials) -> Result<Profile> {
        let mut stmt = self.conn.prepare("SELECT password FROM users WHERE email = ?")?;
        let mut rows = stmt.query([&credentials.email])?;
        let Some(row) = rows.next()? else {
            return errinput!("no such user");
        };
        let password: String = row.get(0)?;
        if password != credentials.password {
            return errinput!("incorrect password");
        }
        drop(rows);
        drop(stmt);

        let mut stmt = self.conn.prepare(
            "SELECT userid, email, firstname, lastname, descr FROM users WHERE email = ?",
        )?;
        let mut rows = stmt.query([&credentials.email])?;
        match rows.next()? {
            Some(row) => Ok(Profile {
                user_id: row.get(0)?,
                email: row.get(1)?,
                firstname: row.get(2)?,
                lastname: row.get(3)?,
                descr: row.get(4)?,
            }),
            None => errdata!("user row vanished for {}", credentials.email),
        }
    }

    /// Returns the profiles of the given user's contacts.
    pub fn contacts_of(&self, user_id: i64) -> Result<Vec<Profile>> {
        let mut stmt = self.conn.prepare(
            "SELECT u.userid, u.email, u.firstname, u.lastname, u.descr
            FROM contacts c INNER JOIN users u ON u.userid = c.contactid
            WHERE c.userid = ?",
        )?;
        let profiles = stmt
            .query_map([user_id], |row| {
                Ok(Profile {
                    user_id: row.get(0)?,
                    email: row.get(1)?,
                    firstname: row.get(2)?,
                    lastname: row.get(3)?,
                    descr: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(profiles)
    }

    /// Returns all user profiles.
    pub fn all_users(&self) -> Result<Vec<Profile>> {
        let mut stmt = self
            .conn
            .prepare("SELECT userid, email, firstname, lastname, descr FROM users")?;
        let profiles = stmt
            .query_map((), |row| {
                Ok(Profile {
                    user_id: row.get(0)?,
                    email: row.get(1)?,
                    firstname: row.get(2)?,
                    lastname: row.get(3)?,
                    descr: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(profiles)
    }

    /// Returns the messages exchanged between two users, in either direction.
    pub fn messages_between(&self, user_id: i64, contact_id: i64) -> Result<Vec<ChatMessage>> {
        let mut stmt = self.conn.prepare(
            "SELECT from_userid, to_userid, message, timestamp, acked
            FROM messages
            WHERE (from_userid = ? AND to_userid = ?) OR (from_userid = ? AND to_userid = ?)",
        )?;
        let messages = stmt
            .query_map([user_id, contact_id, contact_id, user_id], |row| {
                Ok(ChatMessage {
                    from: row.get(0)?,
                    to: row.get(1)?,
                    message: row.get(2)?,
                    timestamp: row.get(3)?,
                    acked: row.get(4)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    /// Checks whether a contact record exists in the given direction.
    pub fn contact_exists(&self, user_id: i64, contact_id: i64) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM contacts WHERE userid = ? AND contactid = ?")?;
        let exists = stmt.query([user_id, contact_id])?.next()?.is_some();
        Ok(exists)
    }

    /// Inserts both directions of a contact pair in one transaction.
    pub fn add_contact(&mut self, user_id: i64, contact_id: i64) -> Result<()> {
        let txn = self.conn.transaction()?;
        txn.execute(INSERT_CONTACT, [user_id, contact_id])?;
        txn.execute(INSERT_CONTACT, [contact_id, user_id])?;
        txn.commit()?;
        Ok(())
    }

    /// Records the address of a client that has contacted this replica.
    /// Duplicates are suppressed by the primary key, making the cache
    /// append-only.
    pub fn cache_ip(&self, addr: &str) -> Result<()> {
        let changed = self.conn.execute("INSERT OR IGNORE INTO ip (addr) VALUES (?)", [addr])?;
        if changed > 0 {
            debug!("cached client address {addr}");
        }
        Ok(())
    }

    /// Returns every client address that has ever contacted this replica.
    pub fn client_ips(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT addr FROM ip")?;
        let addrs = stmt
            .query_map((), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    fn account(email: &str) -> Account {
        Account {
            email: email.into(),
            password: "hash".into(),
            firstname: "Ada".into(),
            lastname: "L".into(),
            descr: "hi".into(),
        }
    }

    fn insert_account(store: &Store, account: &Account) -> i64 {
        store
            .execute(
                INSERT_USER,
                &[
                    account.password.clone().into(),
                    account.email.clone().into(),
                    account.firstname.clone().into(),
                    account.lastname.clone().into(),
                    account.descr.clone().into(),
                ],
            )
            .expect("insert failed")
    }

    #[test]
    fn execute_returns_row_id() -> Result<()> {
        let store = Store::open_memory()?;
        assert_eq!(insert_account(&store, &account("a@b")), 1);
        assert_eq!(insert_account(&store, &account("c@d")), 2);
        Ok(())
    }

    #[test]
    fn execute_rejects_duplicate_email() -> Result<()> {
        let store = Store::open_memory()?;
        insert_account(&store, &account("a@b"));
        let args = [
            "hash".into(),
            "a@b".into(),
            "Ada".into(),
            "L".into(),
            "hi".into(),
        ];
        assert!(matches!(store.execute(INSERT_USER, &args), Err(Error::Storage(_))));
        Ok(())
    }

    #[test]
    fn login_checks_credentials() -> Result<()> {
        let store = Store::open_memory()?;
        insert_account(&store, &account("a@b"));

        let profile = store.login(&Credentials { email: "a@b".into(), password: "hash".into() })?;
        assert_eq!(profile.user_id, 1);
        assert_eq!(profile.email, "a@b");

        assert!(store
            .login(&Credentials { email: "a@b".into(), password: "wrong".into() })
            .is_err());
        assert!(store
            .login(&Credentials { email: "nobody".into(), password: "hash".into() })
            .is_err());
        Ok(())
    }

    #[test]
    fn contacts_are_bidirectional() -> Result<()> {
        let mut store = Store::open_memory()?;
        insert_account(&store, &account("a@b"));
        insert_account(&store, &account("c@d"));
        store.add_contact(1, 2)?;

        assert!(store.contact_exists(1, 2)?);
        assert!(store.contact_exists(2, 1)?);
        assert_eq!(store.contacts_of(1)?.len(), 1);
        assert_eq!(store.contacts_of(2)?[0].user_id, 1);
        Ok(())
    }

    #[test]
    fn messages_query_covers_both_directions() -> Result<()> {
        let store = Store::open_memory()?;
        for (from, to, text) in [(1, 2, "hi"), (2, 1, "hello"), (1, 3, "other")] {
            store.execute(
                INSERT_MESSAGE,
                &[from.into(), to.into(), text.into(), "12:00".into(), 1.into()],
            )?;
        }
        let messages = store.messages_between(1, 2)?;
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().all(|m| m.message != "other"));
        Ok(())
    }

    #[test]
    fn ip_cache_suppresses_duplicates() -> Result<()> {
        let store = Store::open_memory()?;
        store.cache_ip("10.0.0.1")?;
        store.cache_ip("10.0.0.1")?;
        store.cache_ip("10.0.0.2")?;
        let mut addrs = store.client_ips()?;
        addrs.sort();
        assert_eq!(addrs, vec!["10.0.0.1", "10.0.0.2"]);
        Ok(())
    }
}
