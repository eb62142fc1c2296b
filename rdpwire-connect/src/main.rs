//! Headless RDP session demo.
//!
//! # What this does
//!
//! 1. TCP connect, X.224 negotiation (standard RDP security only)
//! 2. MCS connect, RC4 key exchange and licensing
//! 3. Logon and capability exchange
//! 4. Process server traffic until the server ends the session,
//!    following redirects up to `--max-redirects` times unless
//!    `--no-redirects` is given
//!
//! # Run
//! ```text
//! RDPWIRE_PASSWORD=secret cargo run -p rdpwire-connect -- 10.0.0.5 -u alice
//! ```

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use rdpwire_client::{Client, ClientError, Config, LoopExit, TcpTransport};

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "rdpwire-connect", about = "Connect to an RDP server and run a headless session")]
struct Cli {
    /// Server host name or address, optionally `host:port`.
    server: String,

    #[arg(short, long, default_value = "")]
    username: String,

    #[arg(short, long, default_value = "")]
    domain: String,

    #[arg(short, long, env = "RDPWIRE_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Desktop size as `WIDTHxHEIGHT`.
    #[arg(short, long, default_value = "1024x768", value_parser = parse_geometry)]
    geometry: (u16, u16),

    #[arg(short = 'a', long, default_value_t = 16)]
    bpp: u16,

    /// Program to start instead of the shell.
    #[arg(short = 's', long, default_value = "")]
    shell: String,

    /// Speak RDP 4 only.
    #[arg(short = '4', long)]
    rdp4: bool,

    /// Disable RC4 encryption after logon.
    #[arg(short = 'E', long)]
    no_encryption: bool,

    #[arg(long, default_value_t = 3)]
    max_redirects: u32,

    /// Stop at a server redirect instead of reconnecting to its target.
    #[arg(long)]
    no_redirects: bool,

    /// Seconds to wait for the connection and for activation.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

fn parse_geometry(s: &str) -> Result<(u16, u16), String> {
    let (w, h) = s.split_once(['x', 'X']).ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
    let w = w.parse().map_err(|e| format!("width: {e}"))?;
    let h = h.parse().map_err(|e| format!("height: {e}"))?;
    Ok((w, h))
}

fn split_port(server: &str) -> (String, Option<u16>) {
    match server.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_owned(), Some(port)),
            Err(_) => (server.to_owned(), None),
        },
        _ => (server.to_owned(), None),
    }
}

impl Cli {
    fn config(&self) -> Config {
        let defaults = Config::default();
        let (server, port) = split_port(&self.server);
        Config {
            server,
            port: port.unwrap_or(defaults.port),
            username: self.username.clone(),
            domain: self.domain.clone(),
            password: self.password.clone(),
            program: self.shell.clone(),
            width: self.geometry.0,
            height: self.geometry.1,
            bpp: self.bpp,
            rdp5: !self.rdp4,
            encryption: !self.no_encryption,
            connect_timeout: Duration::from_secs(self.timeout),
            follow_redirects: !self.no_redirects,
            ..defaults
        }
    }
}

// ── Main ──────────────────────────────────────────────────────────────────────

fn main() -> ExitCode {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("rdpwire_client=info,rdpwire_proto=warn"),
    )
    .init();

    let cli = Cli::parse();
    let result = run(&cli);
    match &result {
        Ok(()) => {}
        Err(e) if e.is_server_disconnect() => println!("✓ Server ended the session ({e})"),
        Err(e) if e.is_protocol_violation() => {
            eprintln!("✗ protocol violation: {e}");
            if let Some(dump) = e.dump() {
                eprintln!("{dump}");
            }
        }
        Err(e) => eprintln!("✗ {e}"),
    }
    ExitCode::from(exit_status(&result))
}

/// 0 for a clean end (including a server ultimatum), 2 for a protocol
/// violation, 1 otherwise.
fn exit_status(result: &Result<(), ClientError>) -> u8 {
    match result {
        Ok(()) => 0,
        Err(e) if e.is_server_disconnect() => 0,
        Err(e) if e.is_protocol_violation() => 2,
        Err(_) => 1,
    }
}

fn run(cli: &Cli) -> Result<(), ClientError> {
    let config = cli.config();
    let transport = TcpTransport::new(config.connect_timeout, config.recv_timeout);
    let mut client = Client::new(transport, config)?;
    let mut redirects = 0;

    loop {
        println!("Connecting to {}:{} …", client.config().server, client.config().port);
        client.connect()?;
        if client.pending_redirect().is_none() {
            println!("✓ Session active ({}x{})", client.state().width, client.state().height);
        }

        let exit = match client.pending_redirect() {
            Some(_) => LoopExit::Redirect,
            None => client.main_loop()?,
        };
        match exit {
            LoopExit::Requested => {
                client.disconnect();
                return Ok(());
            }
            LoopExit::Redirect if !client.config().follow_redirects => {
                if let Some(r) = client.pending_redirect() {
                    println!("Server redirects to {:?} (session {}); not following", r.server, r.session_id);
                }
                client.disconnect();
                return Ok(());
            }
            LoopExit::Redirect if redirects >= cli.max_redirects => {
                client.disconnect();
                return Err(ClientError::Config(format!("more than {} redirects", cli.max_redirects)));
            }
            LoopExit::Redirect => {
                redirects += 1;
                if let Some(r) = client.reset_for_redirect() {
                    log::info!("redirected to {:?} (session {})", r.server, r.session_id);
                }
            }
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
