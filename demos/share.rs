use lanfetch::{DownloadRequest, Identifier, LanService, LengthError, ServiceEvent};
use std::{convert::TryFrom, env, path::PathBuf, str::FromStr, time::Instant};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

/// Usage: `share [<BUCKET> <FOLDER>]...`
#[tokio::main]
async fn main() {
    pretty_env_logger::init();

    let mut builder = LanService::builder();
    let args: Vec<String> = env::args().skip(1).collect();

    for pair in args.chunks(2) {
        if let [bucket, folder] = pair {
            println!("sharing {} as bucket {:?}", folder, bucket);
            builder = builder.add_bucket(bucket.clone(), folder.clone());
        }
    }

    let (service, mut events) = builder.start().await.unwrap();
    println!(
        "listening on {} as {} ({})",
        service.local_addr(),
        service.local_id(),
        service.config().machine_id
    );

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ServiceEvent::ContactDiscovered(contact) => println!("contact: {:?}", contact),
                ServiceEvent::BootstrapCompleted => println!("bootstrap completed"),
                ServiceEvent::InterfacesChanged => println!("network interfaces changed"),
            }
        }
    });

    match service.query_all_services().await {
        Some(correlation_id) => println!("announced ourselves (correlation id {})", correlation_id),
        None => println!("discovery is disabled"),
    }

    let mut stdout = io::stdout();
    let mut stdin = BufReader::new(io::stdin());
    let mut line = String::new();

    loop {
        stdout.write_all(b"> ").await.unwrap();
        stdout.flush().await.unwrap();

        line.clear();

        if stdin.read_line(&mut line).await.unwrap() > 0 {
            if !handle_command(&service, &line).await {
                break;
            }
        } else {
            break;
        }
    }

    service.stop();
}

async fn handle_command(service: &LanService, command: &str) -> bool {
    match command.parse() {
        Ok(Command::Help) => {
            println!("    h                                   shows this help message");
            println!("    a                                   announce ourselves on the network");
            println!("    c                                   list known contacts");
            println!("    i                                   show the service state");
            println!("    p <KEY> <VALUE>                     store a value on the network");
            println!("    g <KEY>                             look a value up");
            println!("    d <DIR> <BUCKET> <PREFIX> <NAME> <SIZE> <VERSION>");
            println!("                                        download a file into DIR");
            println!("    q                                   quit");
            println!();
            println!("    KEY is either 40 hex digits or '#' followed by text to hash.");
            println!("    PREFIX is '-' for files at the root of the bucket.");
        }
        Ok(Command::Announce) => match service.query_all_services().await {
            Some(correlation_id) => println!("announced (correlation id {})", correlation_id),
            None => println!("discovery is disabled"),
        },
        Ok(Command::Contacts) => {
            for contact in service.known_contacts() {
                println!("{:?}", contact);
            }
        }
        Ok(Command::State) => println!("{:#?}", service.state().await),
        Ok(Command::Put { key, value }) => {
            let stored = service.store(key, value.into_bytes()).await;
            println!("stored on {} contacts", stored);
        }
        Ok(Command::Get { key }) => match service.find_value(key).await {
            Some(value) => println!("found: {}", String::from_utf8_lossy(&value)),
            None => println!("not found"),
        },
        Ok(Command::Download(request)) => {
            println!("downloading {} ({} bytes)...", request.name, request.size);

            let start = Instant::now();
            match service
                .download_file(&request, &CancellationToken::new())
                .await
            {
                Ok(path) => {
                    let elapsed = start.elapsed();
                    println!(
                        "saved {:?} in {}.{:03} seconds",
                        path,
                        elapsed.as_secs(),
                        elapsed.subsec_millis()
                    );
                }
                Err(error) => println!("download failed: {}", error),
            }
        }
        Ok(Command::Quit) => return false,
        Err(_) => println!("invalid command (use 'h' for help)"),
    }

    true
}

enum Command {
    Help,
    Announce,
    Contacts,
    State,
    Put { key: Identifier, value: String },
    Get { key: Identifier },
    Download(DownloadRequest),
    Quit,
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = s.split_whitespace().collect();

        match words.as_slice() {
            ["h"] | ["?"] => Ok(Self::Help),
            ["a"] => Ok(Self::Announce),
            ["c"] => Ok(Self::Contacts),
            ["i"] => Ok(Self::State),
            ["p", key, value @ ..] if !value.is_empty() => Ok(Self::Put {
                key: parse_key(key)?,
                value: value.join(" "),
            }),
            ["g", key] => Ok(Self::Get {
                key: parse_key(key)?,
            }),
            ["d", folder, bucket, prefix, name, size, version] => {
                Ok(Self::Download(DownloadRequest {
                    folder: PathBuf::from(folder),
                    bucket: (*bucket).to_owned(),
                    prefix: if *prefix == "-" {
                        String::new()
                    } else {
                        (*prefix).to_owned()
                    },
                    name: (*name).to_owned(),
                    size: size.parse().map_err(|_| ParseError)?,
                    version: (*version).to_owned(),
                }))
            }
            ["q"] => Ok(Self::Quit),
            _ => Err(ParseError),
        }
    }
}

struct ParseError;

impl From<hex::FromHexError> for ParseError {
    fn from(_: hex::FromHexError) -> Self {
        ParseError
    }
}

impl From<LengthError> for ParseError {
    fn from(_: LengthError) -> Self {
        ParseError
    }
}

fn parse_key(s: &str) -> Result<Identifier, ParseError> {
    match s.strip_prefix('#') {
        Some(text) => Ok(Identifier::sha1(text.as_bytes())),
        None => Ok(Identifier::try_from(hex::decode(s)?.as_ref())?),
    }
}
