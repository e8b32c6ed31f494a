//! # MongoDB Adapter
//!
//! Users live in the `admin` database and get `readWrite` on their own
//! database. Suspension removes that role binding; resume adds it back.
//! Commands are BSON documents, so no string escaping is involved.

use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::error::ErrorKind;
use mongodb::Client;
use tracing::{debug, info};

use super::errors::{AdapterError, AdapterResult};
use super::{Engine, EngineAdapter};

/// `createUser` on an existing user
const USER_ALREADY_EXISTS: i32 = 51003;
/// `dropUser` on a missing user
const USER_NOT_FOUND: i32 = 11;

/// MongoDB adapter holding a shared client (the driver pools internally)
#[derive(Debug, Clone)]
pub struct MongoAdapter {
    client: Client,
}

impl MongoAdapter {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Parse the URL and build a client; no connection is opened until first use
    pub async fn connect(url: &str, max_pool_size: u32) -> AdapterResult<Self> {
        let mut options = mongodb::options::ClientOptions::parse(url)
            .await
            .map_err(classify)?;
        options.max_pool_size = Some(max_pool_size);
        let client = Client::with_options(options).map_err(classify)?;
        Ok(Self { client })
    }

    async fn admin_command(&self, command: Document) -> AdapterResult<()> {
        self.client
            .database("admin")
            .run_command(command, None)
            .await
            .map_err(classify)?;
        Ok(())
    }
}

fn read_write_role(db_name: &str) -> Document {
    doc! { "role": "readWrite", "db": db_name }
}

fn create_user_command(db_name: &str, db_user: &str, password: &str) -> Document {
    doc! {
        "createUser": db_user,
        "pwd": password,
        "roles": [read_write_role(db_name)],
    }
}

fn revoke_command(db_name: &str, db_user: &str) -> Document {
    doc! {
        "revokeRolesFromUser": db_user,
        "roles": [read_write_role(db_name)],
    }
}

fn grant_command(db_name: &str, db_user: &str) -> Document {
    doc! {
        "grantRolesToUser": db_user,
        "roles": [read_write_role(db_name)],
    }
}

fn command_code(err: &mongodb::error::Error) -> Option<i32> {
    match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        _ => None,
    }
}

fn classify(err: mongodb::error::Error) -> AdapterError {
    match err.kind.as_ref() {
        ErrorKind::Io(_)
        | ErrorKind::ServerSelection { .. }
        | ErrorKind::ConnectionPoolCleared { .. } => AdapterError::transient(err.to_string()),
        _ => AdapterError::permanent(err.to_string()),
    }
}

#[async_trait]
impl EngineAdapter for MongoAdapter {
    fn engine(&self) -> Engine {
        Engine::Mongodb
    }

    async fn create(&self, db_name: &str, db_user: &str, password: &str) -> AdapterResult<()> {
        let result = self
            .client
            .database("admin")
            .run_command(create_user_command(db_name, db_user, password), None)
            .await;

        match result {
            Ok(_) => {}
            Err(e) if command_code(&e) == Some(USER_ALREADY_EXISTS) => {
                debug!(db_user, "mongodb user already exists");
                // Make sure the binding is present for a retried create
                self.admin_command(grant_command(db_name, db_user)).await?;
            }
            Err(e) => return Err(classify(e)),
        }

        info!(db_name, db_user, "mongodb user provisioned");
        Ok(())
    }

    async fn suspend(&self, db_name: &str, db_user: &str) -> AdapterResult<()> {
        self.admin_command(revoke_command(db_name, db_user)).await
    }

    async fn resume(&self, db_name: &str, db_user: &str) -> AdapterResult<()> {
        self.admin_command(grant_command(db_name, db_user)).await
    }

    async fn terminate(&self, db_name: &str, db_user: &str) -> AdapterResult<()> {
        let dropped = self
            .client
            .database("admin")
            .run_command(doc! { "dropUser": db_user }, None)
            .await;
        match dropped {
            Ok(_) => {}
            Err(e) if command_code(&e) == Some(USER_NOT_FOUND) => {
                debug!(db_user, "mongodb user already dropped");
            }
            Err(e) => return Err(classify(e)),
        }

        self.client
            .database(db_name)
            .drop(None)
            .await
            .map_err(classify)?;
        info!(db_name, db_user, "mongodb database dropped");
        Ok(())
    }

    async fn rotate_password(&self, db_user: &str, new_password: &str) -> AdapterResult<()> {
        self.admin_command(doc! { "updateUser": db_user, "pwd": new_password })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_user_command() {
        let cmd = create_user_command("db_1", "user_1", "pw");
        assert_eq!(cmd.get_str("createUser").unwrap(), "user_1");
        assert_eq!(cmd.get_str("pwd").unwrap(), "pw");
        let roles = cmd.get_array("roles").unwrap();
        assert_eq!(roles.len(), 1);
        let role = roles[0].as_document().unwrap();
        assert_eq!(role.get_str("role").unwrap(), "readWrite");
        assert_eq!(role.get_str("db").unwrap(), "db_1");
    }

    #[test]
    fn test_revoke_and_grant_bind_same_role() {
        let revoke = revoke_command("db_1", "user_1");
        let grant = grant_command("db_1", "user_1");
        assert_eq!(revoke.get_array("roles").unwrap(), grant.get_array("roles").unwrap());
        assert_eq!(revoke.get_str("revokeRolesFromUser").unwrap(), "user_1");
        assert_eq!(grant.get_str("grantRolesToUser").unwrap(), "user_1");
    }

    #[test]
    fn test_hostile_names_stay_values() {
        let cmd = create_user_command("db\"; x", "user$where", "pw");
        assert_eq!(cmd.get_str("createUser").unwrap(), "user$where");
    }
}
