/*
 * chat is an interactive gateway shell for a mechat cluster. It discovers
 * the current leader from the replica address file, listens for leader
 * pushes on the steering port, and exposes the chat API as simple commands.
 */

#![warn(clippy::all)]

use mechat::error::Result;
use mechat::replica::AddressBook;
use mechat::store::Profile;
use mechat::{errinput, Gateway};

use rustyline::error::ReadlineError;
use std::sync::Arc;

fn main() -> Result<()> {
    let args = clap::command!()
        .name("chat")
        .about("An interactive chat gateway")
        .arg(
            clap::Arg::new("addrs")
                .short('a')
                .long("addrs")
                .default_value("replica_addrs.txt")
                .help("Replica address file, one host:port per line"),
        )
        .arg(
            clap::Arg::new("log_level")
                .short('l')
                .long("log-level")
                .default_value("warn")
                .help("Log level (error, warn, info, debug, trace)"),
        )
        .get_matches();

    let loglevel = args
        .get_one::<String>("log_level")
        .expect("log_level has a default")
        .parse::<simplelog::LevelFilter>()?;
    simplelog::SimpleLogger::init(loglevel, simplelog::Config::default())?;

    let addrs = AddressBook::load(args.get_one::<String>("addrs").expect("addrs has a default"))?;
    let gateway = Arc::new(Gateway::new(addrs));

    // Receive leader pushes after elections. The port may be taken by
    // another gateway on this host; rediscovery covers for that.
    if let Err(e) = gateway.clone().listen_for_leader() {
        eprintln!("steering listener unavailable ({e}), relying on rediscovery");
    }

    let leader = gateway.find_leader()?;
    println!("Connected, current leader is {leader}");

    Shell { gateway, session: None, editor: rustyline::DefaultEditor::new()? }.run()
}

struct Shell {
    gateway: Arc<Gateway>,
    session: Option<Profile>,
    editor: rustyline::DefaultEditor,
}

impl Shell {
    fn run(&mut self) -> Result<()> {
        while let Some(line) = self.prompt()? {
            if line.is_empty() {
                continue;
            }
            if let Err(e) = self.command(&line) {
                println!("Error: {e}");
            }
        }
        Ok(())
    }

    fn command(&mut self, line: &str) -> Result<()> {
        let mut args = line.split_whitespace();
        match args.next() {
            Some("register") => {
                let (Some(email), Some(password), Some(first), Some(last)) =
                    (args.next(), args.next(), args.next(), args.next())
                else {
                    return errinput!("usage: register EMAIL PASSWORD FIRSTNAME LASTNAME [DESCR]");
                };
                let descr = args.collect::<Vec<_>>().join(" ");
                let profile =
                    self.gateway.create_account(email, password, first, last, &descr)?;
                println!("Registered user {} ({})", profile.user_id, profile.email);
                self.session = Some(profile);
            }
            Some("login") => {
                let (Some(email), Some(password)) = (args.next(), args.next()) else {
                    return errinput!("usage: login EMAIL PASSWORD");
                };
                let profile = self.gateway.login(email, password)?;
                println!("Welcome back, {}", profile.firstname);
                self.session = Some(profile);
            }
            Some("users") => {
                for user in self.gateway.all_users()? {
                    println!(
                        "{:>4}  {} {} <{}>  {}",
                        user.user_id, user.firstname, user.lastname, user.email, user.descr
                    );
                }
            }
            Some("contacts") => {
                let me = self.me()?;
                for contact in self.gateway.contacts(me)? {
                    println!(
                        "{:>4}  {} {} <{}>",
                        contact.user_id, contact.firstname, contact.lastname, contact.email
                    );
                }
            }
            Some("add") => {
                let me = self.me()?;
                let Some(contact) = args.next() else {
                    return errinput!("usage: add USERID");
                };
                self.gateway.add_contact(me, contact.parse()?)?;
                println!("Contact added");
            }
            Some("send") => {
                let me = self.me()?;
                let Some(to) = args.next() else {
                    return errinput!("usage: send USERID MESSAGE");
                };
                let text = args.collect::<Vec<_>>().join(" ");
                if text.is_empty() {
                    return errinput!("usage: send USERID MESSAGE");
                }
                self.gateway.send_message(me, to.parse()?, &text)?;
                println!("Sent");
            }
            Some("messages") => {
                let me = self.me()?;
                let Some(contact) = args.next() else {
                    return errinput!("usage: messages USERID");
                };
                for msg in self.gateway.messages(me, contact.parse()?)? {
                    let arrow = if msg.from == me { "->" } else { "<-" };
                    println!("{} {} {}: {}", msg.timestamp, arrow, msg.from, msg.message);
                }
            }
            Some("help") => {
                println!("Commands:");
                println!("  register EMAIL PASSWORD FIRSTNAME LASTNAME [DESCR]");
                println!("  login EMAIL PASSWORD");
                println!("  users | contacts | add USERID");
                println!("  send USERID MESSAGE | messages USERID");
            }
            Some(command) => return errinput!("unknown command {command}, try help"),
            None => {}
        }
        Ok(())
    }

    /// Returns the logged-in user's ID.
    fn me(&self) -> Result<i64> {
        match &self.session {
            Some(profile) => Ok(profile.user_id),
            None => errinput!("log in first"),
        }
    }

    fn prompt(&mut self) -> Result<Option<String>> {
        match self.editor.readline("chat> ") {
            Ok(input) => {
                self.editor.add_history_entry(&input)?;
                Ok(Some(input.trim().to_string()))
            }
            Err(ReadlineError::Eof) | Err(ReadlineError::Interrupted) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
