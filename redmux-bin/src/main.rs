#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]

use redmux_lib::{Collect, Connection, Request, Result, DEFAULT_PORT};

/// Exercises the multiplexer: the connection is driven and used from the
/// same task, a pipelined batch goes out as one write, and several
/// submitters share the queue concurrently.
#[tokio::main]
pub async fn main() -> Result<()> {
    let conn = Connection::new();

    tokio::select! {
        res = conn.run("127.0.0.1", DEFAULT_PORT) => {
            if let Err(err) = res {
                eprintln!("connection terminated: {err}");
            }
        }
        res = submit(&conn) => {
            res?;
            println!("demo complete");
        }
    }

    conn.close();
    Ok(())
}

async fn submit(conn: &Connection) -> Result<()> {
    // One request carrying two commands: a single socket write, replies in
    // submission order.
    let mut batch = Request::new();
    batch.push(["SET", "demo:language", "rust"]);
    batch.push(["GET", "demo:language"]);
    let (reply, bytes) = conn.exec(&batch, Collect::new()).await?;
    println!("batch reply, {bytes} bytes on the wire:");
    for node in reply.into_nodes() {
        println!("  {:?} {}", node.kind, String::from_utf8_lossy(&node.data));
    }

    // Independent submitters: the queue serializes them onto the wire and
    // pairs every reply with its request.
    let bump = || async {
        let mut req = Request::new();
        req.push(["INCR", "demo:counter"]);
        conn.exec(&req, Collect::new()).await
    };
    let (first, second, third) = tokio::join!(bump(), bump(), bump());
    for res in [first, second, third] {
        let (reply, _) = res?;
        if let Some(node) = reply.root() {
            println!("counter bumped to {}", String::from_utf8_lossy(&node.data));
        }
    }

    Ok(())
}
