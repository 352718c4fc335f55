#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Where replication state persists between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CacheBackend {
    /// Local SQLite file under the scratch directory
    Sqlite,
    /// DynamoDB table-set
    #[value(name = "dynamodb")]
    DynamoDb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HttpProtocol {
    Http,
    Https,
}

impl HttpProtocol {
    pub fn as_str(&self) -> &str {
        match self {
            HttpProtocol::Http => "http",
            HttpProtocol::Https => "https",
        }
    }
}
