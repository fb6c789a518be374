// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors

//! TCP front end: one task per connection, a strong-ownership client table,
//! and disconnect cleanup. The watch registry only ever holds weak
//! references to clients; the table here is what keeps them alive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use crate::client::{Client, Command};
use crate::commands;
use crate::db::Db;
use crate::resp;
use crate::transaction::TxnCoordinator;

pub struct Server {
    db: Arc<Db>,
    txn: Arc<TxnCoordinator>,
    clients: DashMap<u64, Arc<Client>>,
    next_client_id: AtomicU64,
}

impl Server {
    pub fn new(db: Arc<Db>, txn: Arc<TxnCoordinator>) -> Arc<Self> {
        Arc::new(Self {
            db,
            txn,
            clients: DashMap::new(),
            next_client_id: AtomicU64::new(0),
        })
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (socket, peer) = listener.accept().await?;
            let _ = socket.set_nodelay(true);
            let server = Arc::clone(self);
            tokio::spawn(async move {
                server.handle_connection(socket, peer.to_string()).await;
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, socket: TcpStream, peer: String) {
        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst) + 1;
        let client = Arc::new(Client::new(id, peer.clone()));
        self.clients.insert(id, Arc::clone(&client));
        info!("client {} connected from {}", id, peer);

        let (read_half, mut write_half) = socket.into_split();
        let mut reader = BufReader::new(read_half);
        let mut out = Vec::with_capacity(4096);

        loop {
            match resp::read_command(&mut reader).await {
                Ok(Some(argv)) if argv.is_empty() => continue,
                Ok(Some(argv)) => {
                    let reply = commands::dispatch(&self.db, &self.txn, &client, Command { argv });
                    out.clear();
                    reply.write_to(&mut out);
                    if write_half.write_all(&out).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!("client {} protocol error: {}", id, err);
                    out.clear();
                    resp::Reply::error(format!("ERR {}", err)).write_to(&mut out);
                    let _ = write_half.write_all(&out).await;
                    break;
                }
            }
        }

        // Disconnect: release the watches eagerly so the registry never has
        // to wait for a lazy reap of this client's entries.
        self.txn.unwatch_all(&client);
        self.clients.remove(&id);
        info!("client {} disconnected", id);
    }
}
