//! Keystone CLI - main entry point.

use keystone::cli::{Cli, Commands};
use keystone::client::KeystoneClient;
use keystone::config::KeystoneConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    keystone::observability::init(&cli.log_level)?;

    match cli.command {
        Commands::Server {
            id,
            members,
            data_dir,
            config,
        } => {
            let mut config = match config {
                Some(path) => KeystoneConfig::from_file(&path)?,
                None => KeystoneConfig::default(),
            };
            config.server_id = id;
            config.cluster_members = members
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(str::to_string)
                .collect();
            config.data_dir = data_dir;
            config.log_level = cli.log_level;

            keystone::run(config).await?;
        }

        Commands::Status { members } => {
            let client = KeystoneClient::from_members_arg(&members)?;
            println!(
                "{:<24} {:>10} {:>6} {:>10} {:>10} {:>12} {:>12}",
                "member", "role", "term", "last_log", "log_term", "commit", "applied"
            );
            for member in client.members().to_vec() {
                match client.show_status(&member).await {
                    Ok(status) => println!(
                        "{:<24} {:>10} {:>6} {:>10} {:>10} {:>12} {:>12}",
                        member,
                        status.status.to_string(),
                        status.term,
                        status.last_log_index,
                        status.last_log_term,
                        status.commit_index,
                        status.last_applied
                    ),
                    Err(_) => println!("{:<24} {:>10}", member, "Offline"),
                }
            }
        }

        Commands::Put {
            key,
            value,
            members,
            uuid,
        } => {
            let client = KeystoneClient::from_members_arg(&members)?;
            match client.put(&key, &value, &uuid).await {
                Ok(()) => println!("OK"),
                Err(e) => {
                    eprintln!("put failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Get { key, members, uuid } => {
            let client = KeystoneClient::from_members_arg(&members)?;
            match client.get(&key, &uuid).await {
                Ok(Some(value)) => println!("{}", value),
                Ok(None) => {
                    eprintln!("no such key: {}", key);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("get failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Del { key, members, uuid } => {
            let client = KeystoneClient::from_members_arg(&members)?;
            match client.del(&key, &uuid).await {
                Ok(()) => println!("OK"),
                Err(e) => {
                    eprintln!("del failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Scan {
            start_key,
            end_key,
            limit,
            members,
            uuid,
        } => {
            let client = KeystoneClient::from_members_arg(&members)?;
            match client.scan(&start_key, &end_key, limit, &uuid).await {
                Ok((items, has_more)) => {
                    for item in items {
                        println!("{}\t{}", item.key, item.value);
                    }
                    if has_more {
                        println!("...");
                    }
                }
                Err(e) => {
                    eprintln!("scan failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Register {
            username,
            password,
            members,
        } => {
            let client = KeystoneClient::from_members_arg(&members)?;
            match client.register(&username, &password).await {
                Ok(status) if status.is_ok() => println!("OK"),
                Ok(status) => {
                    eprintln!("register failed: {}", status);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("register failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Login {
            username,
            password,
            members,
        } => {
            let client = KeystoneClient::from_members_arg(&members)?;
            match client.login(&username, &password).await {
                Ok((status, uuid)) if status.is_ok() => println!("{}", uuid),
                Ok((status, _)) => {
                    eprintln!("login failed: {}", status);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("login failed: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::CleanBinlog { end_index, server } => {
            let client = KeystoneClient::new(vec![server.clone()])?;
            match client.clean_binlog(&server, end_index).await {
                Ok(true) => println!("OK"),
                Ok(false) => {
                    eprintln!("clean refused: end_index {} is beyond last_applied", end_index);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("clean failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
