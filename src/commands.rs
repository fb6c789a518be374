// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 The redkv Authors

//! Command dispatch. Transaction control commands are handled up front;
//! everything else runs under the store's command lock, either directly or
//! replayed from a MULTI queue by EXEC.

use std::sync::Arc;

use bytes::Bytes;

use crate::client::{Client, ClientFlag, Command};
use crate::db::Db;
use crate::errors::TxnError;
use crate::metrics;
use crate::resp::Reply;
use crate::transaction::TxnCoordinator;

const KNOWN_COMMANDS: &[&str] = &[
    "PING", "ECHO", "SELECT", "SET", "GET", "DEL", "EXISTS", "TYPE", "EXPIRE", "TTL", "PERSIST",
    "FLUSHDB", "FLUSHALL", "HSET", "HGET", "HDEL", "HLEN", "HEXISTS", "HGETALL", "SADD", "SREM",
    "SISMEMBER", "SCARD", "SMEMBERS", "ZADD", "ZSCORE", "ZINCRBY", "ZREM", "ZCARD", "WATCH",
    "UNWATCH", "MULTI", "EXEC", "DISCARD",
];

pub fn dispatch(db: &Db, txn: &TxnCoordinator, client: &Arc<Client>, cmd: Command) -> Reply {
    let name = cmd.name();
    if name.is_empty() {
        return Reply::error("ERR empty command");
    }
    let label = if KNOWN_COMMANDS.contains(&name.as_str()) {
        name.as_str()
    } else {
        "unknown"
    };
    metrics::REQUEST_COUNT.with_label_values(&[label]).inc();
    let _timer = metrics::REQUEST_LATENCY
        .with_label_values(&[label])
        .start_timer();

    // Inside MULTI everything is deferred except the transaction controls;
    // nested MULTI and WATCH are rejected right here at queue time.
    if client.is_flag_on(ClientFlag::Multi)
        && !matches!(name.as_str(), "MULTI" | "EXEC" | "DISCARD" | "WATCH")
    {
        client.queue(cmd);
        return Reply::Simple("QUEUED");
    }

    match name.as_str() {
        "MULTI" => {
            if cmd.argv.len() != 1 {
                return wrong_arity("multi");
            }
            match txn.multi(client) {
                Ok(()) => Reply::ok(),
                Err(err) => Reply::error(err.to_string()),
            }
        }
        "EXEC" => {
            if cmd.argv.len() != 1 {
                return wrong_arity("exec");
            }
            let _guard = db.command_lock();
            match txn.exec(client, |queued| execute(db, txn, client, &queued)) {
                Ok(replies) => Reply::Array(replies),
                Err(TxnError::DirtyExec) => Reply::NilArray,
                Err(err) => Reply::error(err.to_string()),
            }
        }
        "DISCARD" => {
            if cmd.argv.len() != 1 {
                return wrong_arity("discard");
            }
            match txn.discard(client) {
                Ok(()) => Reply::ok(),
                Err(err) => Reply::error(err.to_string()),
            }
        }
        "WATCH" => {
            if cmd.argv.len() < 2 {
                return wrong_arity("watch");
            }
            let dbno = client.current_db();
            for key in &cmd.argv[1..] {
                if let Err(err) = txn.watch(client, dbno, key.clone()) {
                    return Reply::error(err.to_string());
                }
            }
            Reply::ok()
        }
        _ => {
            let _guard = db.command_lock();
            execute(db, txn, client, &cmd)
        }
    }
}

/// Runs one non-control command. The caller holds the command lock.
fn execute(db: &Db, txn: &TxnCoordinator, client: &Arc<Client>, cmd: &Command) -> Reply {
    let argv = &cmd.argv;
    let name = cmd.name();
    let dbno = client.current_db();
    match name.as_str() {
        "PING" => match argv.len() {
            1 => Reply::Simple("PONG"),
            2 => Reply::Bulk(argv[1].clone()),
            _ => wrong_arity("ping"),
        },
        "ECHO" => {
            if argv.len() != 2 {
                return wrong_arity("echo");
            }
            Reply::Bulk(argv[1].clone())
        }
        "SELECT" => {
            if argv.len() != 2 {
                return wrong_arity("select");
            }
            match parse_int(&argv[1]) {
                Some(n) if n >= 0 && (n as usize) < db.num_dbs() => {
                    client.set_current_db(n as i32);
                    Reply::ok()
                }
                Some(_) => Reply::error("ERR DB index is out of range"),
                None => Reply::error("ERR value is not an integer or out of range"),
            }
        }
        "UNWATCH" => {
            if argv.len() != 1 {
                return wrong_arity("unwatch");
            }
            txn.unwatch_all(client);
            Reply::ok()
        }

        "SET" => set_command(db, dbno, argv),
        "GET" => {
            if argv.len() != 2 {
                return wrong_arity("get");
            }
            match db.get(dbno, &argv[1]) {
                Ok(Some(value)) => Reply::Bulk(value),
                Ok(None) => Reply::Nil,
                Err(err) => Reply::error(err.to_string()),
            }
        }

        "DEL" => {
            if argv.len() < 2 {
                return wrong_arity("del");
            }
            Reply::Integer(db.del(dbno, &argv[1..]))
        }
        "EXISTS" => {
            if argv.len() < 2 {
                return wrong_arity("exists");
            }
            Reply::Integer(db.exists(dbno, &argv[1..]))
        }
        "TYPE" => {
            if argv.len() != 2 {
                return wrong_arity("type");
            }
            Reply::Simple(db.key_type(dbno, &argv[1]).map_or("none", |t| t.name()))
        }
        "EXPIRE" => {
            if argv.len() != 3 {
                return wrong_arity("expire");
            }
            match parse_int(&argv[2]) {
                Some(seconds) => Reply::Integer(db.expire(dbno, &argv[1], seconds) as i64),
                None => Reply::error("ERR value is not an integer or out of range"),
            }
        }
        "TTL" => {
            if argv.len() != 2 {
                return wrong_arity("ttl");
            }
            Reply::Integer(db.ttl(dbno, &argv[1]))
        }
        "PERSIST" => {
            if argv.len() != 2 {
                return wrong_arity("persist");
            }
            Reply::Integer(db.persist(dbno, &argv[1]) as i64)
        }
        "FLUSHDB" => {
            if argv.len() != 1 {
                return wrong_arity("flushdb");
            }
            db.flush_db(dbno);
            Reply::ok()
        }
        "FLUSHALL" => {
            if argv.len() != 1 {
                return wrong_arity("flushall");
            }
            db.flush_all();
            Reply::ok()
        }

        "HSET" => {
            if argv.len() < 4 || (argv.len() - 2) % 2 != 0 {
                return wrong_arity("hset");
            }
            let pairs: Vec<(Bytes, Bytes)> = argv[2..]
                .chunks(2)
                .map(|pair| (pair[0].clone(), pair[1].clone()))
                .collect();
            int_result(db.hset(dbno, &argv[1], &pairs))
        }
        "HGET" => {
            if argv.len() != 3 {
                return wrong_arity("hget");
            }
            match db.hget(dbno, &argv[1], &argv[2]) {
                Ok(Some(value)) => Reply::Bulk(value),
                Ok(None) => Reply::Nil,
                Err(err) => Reply::error(err.to_string()),
            }
        }
        "HDEL" => {
            if argv.len() < 3 {
                return wrong_arity("hdel");
            }
            int_result(db.hdel(dbno, &argv[1], &argv[2..]))
        }
        "HLEN" => {
            if argv.len() != 2 {
                return wrong_arity("hlen");
            }
            int_result(db.hlen(dbno, &argv[1]))
        }
        "HEXISTS" => {
            if argv.len() != 3 {
                return wrong_arity("hexists");
            }
            bool_result(db.hexists(dbno, &argv[1], &argv[2]))
        }
        "HGETALL" => {
            if argv.len() != 2 {
                return wrong_arity("hgetall");
            }
            match db.hgetall(dbno, &argv[1]) {
                Ok(pairs) => Reply::Array(
                    pairs
                        .into_iter()
                        .flat_map(|(field, value)| [Reply::Bulk(field), Reply::Bulk(value)])
                        .collect(),
                ),
                Err(err) => Reply::error(err.to_string()),
            }
        }

        "SADD" => {
            if argv.len() < 3 {
                return wrong_arity("sadd");
            }
            int_result(db.sadd(dbno, &argv[1], &argv[2..]))
        }
        "SREM" => {
            if argv.len() < 3 {
                return wrong_arity("srem");
            }
            int_result(db.srem(dbno, &argv[1], &argv[2..]))
        }
        "SISMEMBER" => {
            if argv.len() != 3 {
                return wrong_arity("sismember");
            }
            bool_result(db.sismember(dbno, &argv[1], &argv[2]))
        }
        "SCARD" => {
            if argv.len() != 2 {
                return wrong_arity("scard");
            }
            int_result(db.scard(dbno, &argv[1]))
        }
        "SMEMBERS" => {
            if argv.len() != 2 {
                return wrong_arity("smembers");
            }
            match db.smembers(dbno, &argv[1]) {
                Ok(members) => {
                    Reply::Array(members.into_iter().map(Reply::Bulk).collect())
                }
                Err(err) => Reply::error(err.to_string()),
            }
        }

        "ZADD" => {
            if argv.len() < 4 || (argv.len() - 2) % 2 != 0 {
                return wrong_arity("zadd");
            }
            let mut pairs = Vec::with_capacity((argv.len() - 2) / 2);
            for chunk in argv[2..].chunks(2) {
                let Some(score) = parse_float(&chunk[0]) else {
                    return Reply::error("ERR value is not a valid float");
                };
                pairs.push((score, chunk[1].clone()));
            }
            int_result(db.zadd(dbno, &argv[1], &pairs))
        }
        "ZSCORE" => {
            if argv.len() != 3 {
                return wrong_arity("zscore");
            }
            match db.zscore(dbno, &argv[1], &argv[2]) {
                Ok(Some(score)) => Reply::bulk(format_score(score)),
                Ok(None) => Reply::Nil,
                Err(err) => Reply::error(err.to_string()),
            }
        }
        "ZINCRBY" => {
            if argv.len() != 4 {
                return wrong_arity("zincrby");
            }
            let Some(delta) = parse_float(&argv[2]) else {
                return Reply::error("ERR value is not a valid float");
            };
            match db.zincrby(dbno, &argv[1], delta, &argv[3]) {
                Ok(score) => Reply::bulk(format_score(score)),
                Err(err) => Reply::error(err.to_string()),
            }
        }
        "ZREM" => {
            if argv.len() < 3 {
                return wrong_arity("zrem");
            }
            int_result(db.zrem(dbno, &argv[1], &argv[2..]))
        }
        "ZCARD" => {
            if argv.len() != 2 {
                return wrong_arity("zcard");
            }
            int_result(db.zcard(dbno, &argv[1]))
        }

        _ => Reply::error(format!("ERR unknown command '{}'", name.to_lowercase())),
    }
}

fn set_command(db: &Db, dbno: i32, argv: &[Bytes]) -> Reply {
    if argv.len() != 3 && argv.len() != 5 {
        return wrong_arity("set");
    }
    let mut expire_secs = None;
    if argv.len() == 5 {
        if !argv[3].eq_ignore_ascii_case(b"EX") {
            return Reply::error("ERR syntax error");
        }
        match parse_int(&argv[4]) {
            Some(seconds) if seconds > 0 => expire_secs = Some(seconds as u64),
            _ => return Reply::error("ERR invalid expire time in 'set' command"),
        }
    }
    db.set(dbno, &argv[1], argv[2].clone(), expire_secs);
    Reply::ok()
}

fn wrong_arity(name: &str) -> Reply {
    Reply::error(format!(
        "ERR wrong number of arguments for '{}' command",
        name
    ))
}

fn parse_int(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

fn parse_float(raw: &[u8]) -> Option<f64> {
    let parsed: f64 = std::str::from_utf8(raw).ok()?.parse().ok()?;
    parsed.is_finite().then_some(parsed)
}

fn int_result(result: Result<i64, crate::errors::StoreError>) -> Reply {
    match result {
        Ok(n) => Reply::Integer(n),
        Err(err) => Reply::error(err.to_string()),
    }
}

fn bool_result(result: Result<bool, crate::errors::StoreError>) -> Reply {
    match result {
        Ok(b) => Reply::Integer(b as i64),
        Err(err) => Reply::error(err.to_string()),
    }
}

/// Redis prints integral scores without a fractional part.
fn format_score(score: f64) -> String {
    if score == score.trunc() && score.abs() < 1e17 {
        format!("{}", score as i64)
    } else {
        format!("{}", score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_formatting() {
        assert_eq!(format_score(3.0), "3");
        assert_eq!(format_score(-2.0), "-2");
        assert_eq!(format_score(1.5), "1.5");
        assert_eq!(format_score(0.0), "0");
    }

    #[test]
    fn numeric_parsing() {
        assert_eq!(parse_int(b"42"), Some(42));
        assert_eq!(parse_int(b"-1"), Some(-1));
        assert_eq!(parse_int(b"4.2"), None);
        assert_eq!(parse_float(b"1.5"), Some(1.5));
        assert_eq!(parse_float(b"nan"), None);
        assert_eq!(parse_float(b"x"), None);
    }
}
