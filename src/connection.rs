//! Connection FSM and command dispatch.
//!
//! Drives one client connection end to end: reads a framed command,
//! tokenizes it, dispatches to a handler, and writes back one or more
//! framed reply lines. Grounded on `original_source/robin/src/robin_conn.c`
//! (`robin_cmds` dispatch table, `rc_reply` framing, the oversized-command
//! counter). The exact reply codes below are reproduced verbatim because
//! real clients switch on them.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::cips::CipLog;
use crate::config::Limits;
use crate::errors::{AuthError, Error, StateError};
use crate::frame;
use crate::tokenizer;
use crate::users::{AddOutcome, EdgeCode, UserStore};

/// Per-connection state.
struct Connection {
    logged_in: bool,
    uid: Option<usize>,
    oversized_count: u32,
}

impl Connection {
    fn new() -> Self {
        Connection {
            logged_in: false,
            uid: None,
            oversized_count: 0,
        }
    }
}

/// Drives `stream` until the client disconnects, sends `quit`, the
/// connection is terminated for cause (oversized flood, fatal I/O), or
/// `shutdown` is cancelled. On exit, releases any acquired `uid` regardless
/// of how the loop ends. The frame read is raced against `shutdown` so a
/// worker blocked waiting on an idle client still unblocks immediately
/// when the server is shutting down — without this, `pool.close()` would
/// wait forever on a worker stuck in `frame::recv`.
pub async fn serve(
    mut stream: TcpStream,
    peer: String,
    users: Arc<UserStore>,
    cips: Arc<CipLog>,
    limits: Limits,
    shutdown: CancellationToken,
) {
    let mut conn = Connection::new();

    loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                debug!(target: "cips::connection", "{peer}: shutting down, aborting idle read");
                break;
            }
            received = frame::recv(&mut stream, limits.max_frame_len) => received,
        };

        match received {
            Ok(None) => {
                debug!(target: "cips::connection", "{peer}: peer closed connection");
                break;
            }
            Ok(Some(bytes)) => {
                if bytes.len() as u32 > limits.cmd_max_len {
                    conn.oversized_count += 1;
                    let msg = format!(
                        "-1 command string exceeds the maximum length of {} bytes",
                        limits.cmd_max_len
                    );
                    if frame::send(&mut stream, msg.as_bytes()).await.is_err() {
                        break;
                    }
                    warn!(
                        target: "cips::connection",
                        "{peer}: oversized command #{}/{}",
                        conn.oversized_count, limits.oversized_threshold
                    );
                    if conn.oversized_count >= limits.oversized_threshold {
                        break;
                    }
                    continue;
                }

                let line = String::from_utf8_lossy(&bytes).into_owned();
                match dispatch(&mut conn, &line, &users, &cips, limits).await {
                    Ok(reply) => {
                        if send_reply(&mut stream, &reply).await.is_err() {
                            break;
                        }
                        if reply.quit {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = frame::send(&mut stream, format!("-1 {e}").as_bytes()).await;
                        if e.is_fatal_to_connection() {
                            break;
                        }
                    }
                }
            }
            Err(Error::TooLarge { .. }) => {
                conn.oversized_count += 1;
                let msg = format!(
                    "-1 command string exceeds the maximum length of {} bytes",
                    limits.cmd_max_len
                );
                if frame::send(&mut stream, msg.as_bytes()).await.is_err() {
                    break;
                }
                if conn.oversized_count >= limits.oversized_threshold {
                    break;
                }
            }
            Err(e) if e.is_fatal_to_connection() => {
                info!(target: "cips::connection", "{peer}: fatal error: {e}");
                break;
            }
            Err(e) => {
                warn!(target: "cips::connection", "{peer}: {e}");
            }
        }
    }

    if let Some(uid) = conn.uid {
        users.release(uid);
    }
}

/// A reply: the first line always carries the status prefix;
/// `lines[1..]` are the additional data packets, whose count is the `N`
/// encoded in `lines[0]`.
struct Reply {
    lines: Vec<String>,
    quit: bool,
}

impl Reply {
    fn single(line: impl Into<String>) -> Self {
        Reply {
            lines: vec![line.into()],
            quit: false,
        }
    }

    fn quit(line: impl Into<String>) -> Self {
        Reply {
            lines: vec![line.into()],
            quit: true,
        }
    }

    fn multi(header: impl Into<String>, data: Vec<String>) -> Self {
        let mut lines = vec![header.into()];
        lines.extend(data);
        Reply { lines, quit: false }
    }
}

async fn send_reply(stream: &mut TcpStream, reply: &Reply) -> Result<(), Error> {
    for line in &reply.lines {
        frame::send(stream, line.as_bytes()).await?;
    }
    Ok(())
}

async fn dispatch(
    conn: &mut Connection,
    line: &str,
    users: &UserStore,
    cips: &CipLog,
    limits: Limits,
) -> Result<Reply, Error> {
    let argv = tokenizer::tokenize(line);

    let Some(cmd) = argv.first().map(|s| s.as_str()) else {
        return Ok(Reply::single("-1 invalid command; type help for a list of commands"));
    };

    match cmd {
        "help" => cmd_help(&argv),
        "register" => cmd_register(&argv, users),
        "login" => cmd_login(conn, &argv, users),
        "logout" => cmd_logout(conn, &argv, users),
        "follow" => cmd_follow(conn, &argv, users),
        "unfollow" => cmd_unfollow(conn, &argv, users),
        "following" => cmd_following(conn, &argv, users),
        "followers" => cmd_followers(conn, &argv, users),
        "cip" => cmd_cip(conn, &argv, users, cips, limits),
        "cips_since" => cmd_cips_since(conn, &argv, users, cips),
        "hashtags_since" => cmd_hashtags_since(conn, &argv, cips),
        "quit" => Ok(Reply::quit("0 bye bye!")),
        _ => Ok(Reply::single(
            "-1 invalid command; type help for a list of commands",
        )),
    }
}

const COMMAND_TABLE: &[(&str, &str, &str)] = &[
    ("help", "", "print this help"),
    ("register", "<email> <password>", "register with email and password"),
    ("login", "<email> <password>", "log in with email and password"),
    ("logout", "", "log out"),
    ("follow", "<email> [email...]", "follow one or more users"),
    ("unfollow", "<email> [email...]", "unfollow one or more users"),
    ("following", "", "list the users you follow"),
    ("followers", "", "list your followers"),
    ("cip", "\"<message>\"", "publish a cip"),
    ("cips_since", "<timestamp>", "read cips since a timestamp"),
    ("hashtags_since", "<timestamp>", "read hashtag counts since a timestamp"),
    ("quit", "", "terminate the connection"),
];

fn cmd_help(argv: &[String]) -> Result<Reply, Error> {
    if argv.len() != 1 {
        return Ok(Reply::single("-1 invalid number of arguments"));
    }

    let lines = COMMAND_TABLE
        .iter()
        .map(|(name, usage, desc)| format!("{name} {usage}\t{desc}"))
        .collect();

    Ok(Reply::multi(COMMAND_TABLE.len().to_string(), lines))
}

fn cmd_register(argv: &[String], users: &UserStore) -> Result<Reply, Error> {
    if argv.len() != 3 {
        return Ok(Reply::single("-1 invalid number of arguments"));
    }
    let (email, password) = (&argv[1], &argv[2]);

    match users.add(email, password)? {
        AddOutcome::Ok(_) => Ok(Reply::single("0 user registered successfully")),
        AddOutcome::BadFormat => Ok(Reply::single("-2 invalid email/password format")),
        AddOutcome::AlreadyExists => {
            Ok(Reply::single(format!("-3 user {email} is already registered")))
        }
    }
}

fn cmd_login(conn: &mut Connection, argv: &[String], users: &UserStore) -> Result<Reply, Error> {
    if argv.len() != 3 {
        return Ok(Reply::single("-1 invalid number of arguments"));
    }
    let (email, password) = (&argv[1], &argv[2]);

    if conn.logged_in {
        let current = users.email_of(conn.uid.unwrap())?;
        return Ok(Reply::single(format!("-2 already signed-in as {current}")));
    }

    match users.acquire(email, password) {
        Ok(uid) => {
            conn.logged_in = true;
            conn.uid = Some(uid);
            Ok(Reply::single("0 user logged-in successfully"))
        }
        Err(Error::Auth(AuthError::Busy)) => {
            Ok(Reply::single("-3 user already logged in from another client"))
        }
        Err(Error::Auth(AuthError::NoSuchEmail)) => Ok(Reply::single("-4 invalid email")),
        Err(Error::Auth(AuthError::BadPassword)) => Ok(Reply::single("-5 invalid password")),
        Err(e) => Err(e),
    }
}

fn cmd_logout(conn: &mut Connection, argv: &[String], users: &UserStore) -> Result<Reply, Error> {
    if argv.len() != 1 {
        return Ok(Reply::single("-1 invalid number of arguments"));
    }

    let Some(uid) = conn.uid.filter(|_| conn.logged_in) else {
        return Ok(Reply::single("-2 login is required before logout"));
    };

    users.release(uid);
    conn.logged_in = false;
    conn.uid = None;

    Ok(Reply::single("0 logout successful"))
}

fn require_login(conn: &Connection) -> Result<usize, Error> {
    conn.uid
        .filter(|_| conn.logged_in)
        .ok_or(Error::State(StateError::NotLoggedIn))
}

fn cmd_follow(conn: &mut Connection, argv: &[String], users: &UserStore) -> Result<Reply, Error> {
    edge_command(conn, argv, users, UserStore::follow)
}

fn cmd_unfollow(conn: &mut Connection, argv: &[String], users: &UserStore) -> Result<Reply, Error> {
    edge_command(conn, argv, users, UserStore::unfollow)
}

/// Shared implementation for `follow`/`unfollow`: both apply the same
/// per-email-result aggregation.
fn edge_command(
    conn: &mut Connection,
    argv: &[String],
    users: &UserStore,
    op: fn(&UserStore, usize, &str) -> Result<EdgeCode, Error>,
) -> Result<Reply, Error> {
    if argv.len() < 2 {
        return Ok(Reply::single("-1 invalid number of arguments"));
    }

    let uid = match require_login(conn) {
        Ok(uid) => uid,
        Err(_) => return Ok(Reply::single("-1 login is required")),
    };

    let mut results = Vec::with_capacity(argv.len() - 1);

    for email in &argv[1..] {
        let code = op(users, uid, email)?;
        let text = match code {
            EdgeCode::Ok => "ok",
            EdgeCode::NoSuchEmail => "no such user",
            EdgeCode::NoChange => "no change",
        };
        results.push(format!("{email} {} {text}", code as i32));
    }

    Ok(Reply::multi(results.len().to_string(), results))
}

fn cmd_following(conn: &Connection, argv: &[String], users: &UserStore) -> Result<Reply, Error> {
    if argv.len() != 1 {
        return Ok(Reply::single("-1 invalid number of arguments"));
    }
    let uid = match require_login(conn) {
        Ok(uid) => uid,
        Err(_) => return Ok(Reply::single("-1 login is required")),
    };

    let emails = users.following_of(uid)?;
    Ok(Reply::multi(emails.len().to_string(), emails))
}

fn cmd_followers(conn: &Connection, argv: &[String], users: &UserStore) -> Result<Reply, Error> {
    if argv.len() != 1 {
        return Ok(Reply::single("-1 invalid number of arguments"));
    }
    let uid = match require_login(conn) {
        Ok(uid) => uid,
        Err(_) => return Ok(Reply::single("-1 login is required")),
    };

    let emails = users.followers_of(uid)?;
    Ok(Reply::multi(emails.len().to_string(), emails))
}

fn cmd_cip(
    conn: &Connection,
    argv: &[String],
    users: &UserStore,
    cips: &CipLog,
    limits: Limits,
) -> Result<Reply, Error> {
    if argv.len() != 2 {
        return Ok(Reply::single("-1 invalid number of arguments"));
    }

    let uid = match require_login(conn) {
        Ok(uid) => uid,
        Err(_) => return Ok(Reply::single("-2 login is required before posting")),
    };

    let text = &argv[1];
    if text.is_empty() || text.len() > limits.cip_max_len {
        return Ok(Reply::single(format!(
            "-1 cip text must be between 1 and {} bytes",
            limits.cip_max_len
        )));
    }

    // Looked up fresh from the store rather than cached on the
    // connection, so the author is always the email on file at post time.
    let author = users.email_of(uid)?;
    cips.append(&author, text);

    Ok(Reply::single("0 cip posted successfully"))
}

fn cmd_cips_since(
    conn: &Connection,
    argv: &[String],
    users: &UserStore,
    cips: &CipLog,
) -> Result<Reply, Error> {
    if argv.len() != 2 {
        return Ok(Reply::single("-1 invalid number of arguments"));
    }

    let uid = match require_login(conn) {
        Ok(uid) => uid,
        Err(_) => return Ok(Reply::single("-1 login is required")),
    };

    let since: i64 = argv[1]
        .parse()
        .map_err(|_| Error::Domain(crate::errors::DomainError::BadFormat))?;

    let following = users.following_of(uid)?;
    let views = cips.cips_since(since, &following);

    let lines = views
        .iter()
        .map(|v| format!("{} {} \"{}\"", v.ts, v.author, v.text))
        .collect();

    Ok(Reply::multi(views.len().to_string(), lines))
}

fn cmd_hashtags_since(
    conn: &Connection,
    argv: &[String],
    cips: &CipLog,
) -> Result<Reply, Error> {
    if argv.len() != 2 {
        return Ok(Reply::single("-1 invalid number of arguments"));
    }
    if require_login(conn).is_err() {
        return Ok(Reply::single("-1 login is required"));
    }

    let since: i64 = argv[1]
        .parse()
        .map_err(|_| Error::Domain(crate::errors::DomainError::BadFormat))?;

    let mut tally = cips.hashtags_since(since);
    tally.sort_by(|a, b| a.0.cmp(&b.0));

    let lines = tally
        .iter()
        .map(|(tag, count)| format!("{tag} {count}"))
        .collect();

    Ok(Reply::multi(tally.len().to_string(), lines))
}
