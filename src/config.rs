//! Server configuration, parsed from command-line flags.

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// 0 disables the memcached listener.
    pub memcache_port: u16,
    pub databases: usize,
    pub shards: usize,
    /// Non-empty password puts fresh connections into the auth-required state.
    pub requirepass: Option<String>,
    /// Present when this instance replicates another; makes it read-only.
    pub replicaof: Option<(String, u16)>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "127.0.0.1".to_string(),
            port: 6379,
            memcache_port: 0,
            databases: 16,
            shards: 4,
            requirepass: None,
            replicaof: None,
        }
    }
}

impl Config {
    pub fn from_args(args: &[String]) -> Self {
        let mut config = Config::default();
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--port" => {
                    if i + 1 < args.len() {
                        if let Ok(p) = args[i + 1].parse() {
                            config.port = p;
                        }
                        i += 1;
                    }
                }
                "--memcache-port" => {
                    if i + 1 < args.len() {
                        if let Ok(p) = args[i + 1].parse() {
                            config.memcache_port = p;
                        }
                        i += 1;
                    }
                }
                "--bind" => {
                    if i + 1 < args.len() {
                        config.bind = args[i + 1].clone();
                        i += 1;
                    }
                }
                "--requirepass" => {
                    if i + 1 < args.len() {
                        if !args[i + 1].is_empty() {
                            config.requirepass = Some(args[i + 1].clone());
                        }
                        i += 1;
                    }
                }
                "--databases" => {
                    if i + 1 < args.len() {
                        if let Ok(d) = args[i + 1].parse() {
                            config.databases = d;
                        }
                        i += 1;
                    }
                }
                "--shards" => {
                    if i + 1 < args.len() {
                        if let Ok(s) = args[i + 1].parse::<usize>() {
                            config.shards = s.max(1);
                        }
                        i += 1;
                    }
                }
                "--replicaof" => {
                    if i + 2 < args.len() {
                        let host = args[i + 1].clone();
                        if host.eq_ignore_ascii_case("no") && args[i + 2].eq_ignore_ascii_case("one")
                        {
                            config.replicaof = None;
                        } else if let Ok(port) = args[i + 2].parse::<u16>() {
                            config.replicaof = Some((host, port));
                        }
                        i += 2;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        config
    }
}
