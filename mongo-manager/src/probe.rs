// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Admin-command probes against running servers
//!
//! Every operation here opens a fresh client, runs one or a few commands on
//! the `admin` database, and shuts the client down on every exit path.  The
//! deployment lifecycle never holds a long-lived connection: connections are
//! a tool for asking one question ("are you up?", "form this replica set",
//! "register this shard"), not a resource to manage.

use crate::error::Error;
use crate::options::Options;
use crate::poll;
use mongodb::bson::{doc, Document};
use mongodb::options::{
    ClientOptions, Credential, ServerAddress, Tls, TlsOptions,
};
use mongodb::Client;
use slog::Logger;
use std::time::Duration;

/// How long a replica-set member may take to reach PRIMARY or SECONDARY
pub const PROVISION_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to keep retrying the first ping of a just-spawned server
pub const PING_RETRY_TIMEOUT: Duration = Duration::from_secs(30);

const PROVISION_POLL_INTERVAL: Duration = Duration::from_secs(1);
const PING_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// How a probe connection addresses its target
#[derive(Debug, Clone)]
pub enum ConnectMode {
    /// speak to exactly the addressed server
    Direct,
    /// address the named replica set through the given seed
    ReplicaSet(String),
}

/// Issues admin commands to deployment members
///
/// Carries the TLS configuration and (optionally) credentials that every
/// probe connection needs; the per-operation client is built from these.
#[derive(Clone)]
pub struct Prober {
    tls: Option<TlsOptions>,
    credential: Option<Credential>,
    log: Logger,
}

impl Prober {
    pub fn new(options: &Options, log: &Logger) -> Prober {
        Prober {
            tls: client_tls_options(options),
            credential: None,
            log: log.clone(),
        }
    }

    /// Returns a prober whose connections authenticate as `username`
    pub fn with_credentials(mut self, username: &str, password: &str) -> Prober {
        let mut credential = Credential::default();
        credential.username = Some(username.to_string());
        credential.password = Some(password.to_string());
        self.credential = Some(credential);
        self
    }

    /// Sends `{ping: 1}`
    pub async fn ping(
        &self,
        address: &str,
        mode: &ConnectMode,
    ) -> Result<(), Error> {
        self.run_admin_command(address, mode, "ping", doc! { "ping": 1 })
            .await
            .map(|_| ())
    }

    /// Pings with retry until the server answers or `timeout` passes
    ///
    /// A freshly spawned server has written its pid file but may not be
    /// listening yet; the last underlying probe error is returned on timeout.
    pub async fn wait_for_ping(
        &self,
        address: &str,
        mode: &ConnectMode,
        timeout: Duration,
    ) -> Result<(), Error> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.ping(address, mode).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(e);
                    }
                    tokio::time::sleep(PING_RETRY_INTERVAL).await;
                }
            }
        }
    }

    /// Sends `replSetInitiate` to `seed` with the given member set
    ///
    /// The arbiter, if present, gets the member id after the data-bearing
    /// hosts and `arbiterOnly: true`.  `configsvr` marks the set as a config
    /// server replica set.
    pub async fn replica_set_initiate(
        &self,
        seed: &str,
        rs_name: &str,
        hosts: &[String],
        arbiter: Option<&str>,
        configsvr: bool,
    ) -> Result<(), Error> {
        let mut config = doc! {
            "_id": rs_name,
            "members": member_documents(hosts, arbiter),
        };
        if configsvr {
            config.insert("configsvr", true);
        }
        debug!(self.log, "initiating replica set";
            "name" => rs_name, "seed" => seed);
        self.run_admin_command(
            seed,
            &ConnectMode::Direct,
            "replSetInitiate",
            doc! { "replSetInitiate": config },
        )
        .await
        .map(|_| ())
    }

    /// Registers `shard` (a `rsname/host:port` spec) through `router`
    pub async fn add_shard(
        &self,
        router: &str,
        shard: &str,
    ) -> Result<(), Error> {
        debug!(self.log, "adding shard"; "router" => router, "shard" => shard);
        let client = self.client(router, &ConnectMode::Direct)?;
        let result = client
            .database("admin")
            .run_command(doc! { "addShard": shard })
            .await;
        client.shutdown().await;
        result.map(|_| ()).map_err(|source| Error::AddShard {
            router: router.to_string(),
            shard: shard.to_string(),
            source,
        })
    }

    /// Creates a root user on the `admin` database
    pub async fn create_user(
        &self,
        address: &str,
        mode: &ConnectMode,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        debug!(self.log, "creating root user";
            "address" => address, "username" => username);
        self.run_admin_command(
            address,
            mode,
            "createUser",
            doc! {
                "createUser": username,
                "pwd": password,
                "roles": ["root"],
            },
        )
        .await
        .map(|_| ())
    }

    /// Polls `address` (direct) until it reports itself primary or secondary
    ///
    /// `isMaster` is used rather than `hello` because every supported server
    /// version answers it.  Command failures are retried: a member that is
    /// mid-election or still applying the initial config refuses commands
    /// transiently.
    pub async fn wait_until_provisioned(
        &self,
        address: &str,
        timeout: Duration,
    ) -> Result<(), Error> {
        let client = self.client(address, &ConnectMode::Direct)?;
        let admin = client.database("admin");
        let result = poll::wait_for_condition::<(), std::convert::Infallible, _, _>(
            || {
                let admin = admin.clone();
                async move {
                    match admin.run_command(doc! { "isMaster": 1 }).await {
                        Ok(reply) => {
                            let primary =
                                reply.get_bool("ismaster").unwrap_or(false);
                            let secondary =
                                reply.get_bool("secondary").unwrap_or(false);
                            if primary || secondary {
                                Ok(())
                            } else {
                                Err(poll::CondCheckError::NotYet)
                            }
                        }
                        Err(_) => Err(poll::CondCheckError::NotYet),
                    }
                }
            },
            &PROVISION_POLL_INTERVAL,
            &timeout,
        )
        .await;
        client.shutdown().await;
        match result {
            Ok(()) => {
                debug!(self.log, "member provisioned"; "address" => address);
                Ok(())
            }
            Err(poll::Error::TimedOut(_)) => Err(Error::ProvisionTimeout {
                address: address.to_string(),
                timeout,
            }),
            Err(poll::Error::PermanentError(never)) => match never {},
        }
    }

    async fn run_admin_command(
        &self,
        address: &str,
        mode: &ConnectMode,
        name: &'static str,
        command: Document,
    ) -> Result<Document, Error> {
        let client = self.client(address, mode)?;
        let result = client.database("admin").run_command(command).await;
        client.shutdown().await;
        result.map_err(|source| Error::Probe {
            command: name,
            address: address.to_string(),
            source,
        })
    }

    fn client(
        &self,
        address: &str,
        mode: &ConnectMode,
    ) -> Result<Client, Error> {
        let client_options = self.client_options(address, mode)?;
        Client::with_options(client_options).map_err(|source| Error::Probe {
            command: "connect",
            address: address.to_string(),
            source,
        })
    }

    fn client_options(
        &self,
        address: &str,
        mode: &ConnectMode,
    ) -> Result<ClientOptions, Error> {
        let (host, port) = parse_address(address)?;
        let mut client_options = ClientOptions::default();
        client_options.hosts =
            vec![ServerAddress::Tcp { host, port: Some(port) }];
        client_options.app_name = Some(String::from("mongo-manager"));
        client_options.connect_timeout = Some(CONNECT_TIMEOUT);
        client_options.server_selection_timeout =
            Some(SERVER_SELECTION_TIMEOUT);
        match mode {
            ConnectMode::Direct => {
                client_options.direct_connection = Some(true);
            }
            ConnectMode::ReplicaSet(name) => {
                client_options.repl_set_name = Some(name.clone());
            }
        }
        client_options.tls = self.tls.clone().map(Tls::Enabled);
        client_options.credential = self.credential.clone();
        Ok(client_options)
    }
}

// Builds the replSetInitiate member list.  Data-bearing hosts get ids in
// list order; the arbiter gets the next id.
fn member_documents(hosts: &[String], arbiter: Option<&str>) -> Vec<Document> {
    let mut members: Vec<Document> = hosts
        .iter()
        .enumerate()
        .map(|(i, host)| doc! { "_id": i as i32, "host": host })
        .collect();
    if let Some(arbiter) = arbiter {
        members.push(doc! {
            "_id": hosts.len() as i32,
            "host": arbiter,
            "arbiterOnly": true,
        });
    }
    members
}

// Client-side TLS is engaged when the servers demand or prefer it;
// `allowTLS` servers still accept plain connections.
fn client_tls_options(options: &Options) -> Option<TlsOptions> {
    let mode = options.tls_mode.as_deref()?;
    if mode != "requireTLS" && mode != "preferTLS" {
        return None;
    }
    let mut tls = TlsOptions::default();
    tls.ca_file_path =
        options.tls_ca_file.as_ref().map(|p| p.as_std_path().to_path_buf());
    tls.cert_key_file_path = options
        .tls_certificate_key_file
        .as_ref()
        .map(|p| p.as_std_path().to_path_buf());
    Some(tls)
}

fn parse_address(address: &str) -> Result<(String, u16), Error> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        Error::InvalidOptions(format!("malformed server address {:?}", address))
    })?;
    let port = port.parse().map_err(|_| {
        Error::InvalidOptions(format!("malformed server address {:?}", address))
    })?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod test {
    use super::*;
    use camino::Utf8PathBuf;
    use slog::Logger;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn test_options() -> Options {
        Options::new("/tmp/d")
    }

    #[test]
    fn test_member_documents_with_arbiter() {
        let hosts =
            vec![String::from("localhost:27017"), String::from("localhost:27018")];
        let members = member_documents(&hosts, Some("localhost:27019"));
        assert_eq!(members.len(), 3);
        assert_eq!(members[0].get_i32("_id").unwrap(), 0);
        assert_eq!(members[0].get_str("host").unwrap(), "localhost:27017");
        assert!(members[0].get_bool("arbiterOnly").is_err());
        assert_eq!(members[2].get_i32("_id").unwrap(), 2);
        assert_eq!(members[2].get_str("host").unwrap(), "localhost:27019");
        assert!(members[2].get_bool("arbiterOnly").unwrap());
    }

    #[test]
    fn test_client_options_modes() {
        let prober = Prober::new(&test_options(), &test_logger());

        let direct = prober
            .client_options("localhost:30002", &ConnectMode::Direct)
            .unwrap();
        assert_eq!(direct.direct_connection, Some(true));
        assert!(direct.repl_set_name.is_none());
        assert_eq!(
            direct.hosts,
            vec![ServerAddress::Tcp {
                host: String::from("localhost"),
                port: Some(30002),
            }]
        );

        let rs = prober
            .client_options(
                "localhost:27017",
                &ConnectMode::ReplicaSet(String::from("rs0")),
            )
            .unwrap();
        assert_eq!(rs.repl_set_name.as_deref(), Some("rs0"));
        assert!(rs.direct_connection.is_none());
    }

    #[test]
    fn test_client_options_credentials() {
        let prober = Prober::new(&test_options(), &test_logger());
        let plain = prober
            .client_options("localhost:27017", &ConnectMode::Direct)
            .unwrap();
        assert!(plain.credential.is_none());

        let authed = prober.with_credentials("root", "hunter2");
        let options = authed
            .client_options("localhost:27017", &ConnectMode::Direct)
            .unwrap();
        let credential = options.credential.expect("credential missing");
        assert_eq!(credential.username.as_deref(), Some("root"));
        assert_eq!(credential.password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_client_tls_engaged_by_mode() {
        let mut options = test_options();
        assert!(client_tls_options(&options).is_none());

        options.tls_mode = Some(String::from("allowTLS"));
        assert!(client_tls_options(&options).is_none());

        options.tls_mode = Some(String::from("requireTLS"));
        options.tls_ca_file = Some(Utf8PathBuf::from("/certs/ca.pem"));
        let tls = client_tls_options(&options).expect("tls not engaged");
        assert_eq!(
            tls.ca_file_path.as_deref(),
            Some(std::path::Path::new("/certs/ca.pem"))
        );
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("localhost:27017").unwrap(),
            (String::from("localhost"), 27017)
        );
        assert!(parse_address("localhost").is_err());
        assert!(parse_address("localhost:notaport").is_err());
    }
}
