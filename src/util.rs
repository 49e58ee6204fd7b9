use std::path::PathBuf;

const POSTGRES_USER: &str = "POSTGRES_USER";
const POSTGRES_PASSWORD: &str = "POSTGRES_PASSWORD";
const POSTGRES_DATABASE: &str = "POSTGRES_DATABASE";
const POSTGRES_HOST: &str = "POSTGRES_HOST";

const DEFAULT_POSTGRES_HOST: &str = "postgres:5432";

/// Full connection URL, takes precedence over the assembled Postgres URL
const DATABASE_URL: &str = "DATABASE_URL";

const INFLUXDB_URL: &str = "INFLUXDB_URL";
const INFLUXDB_TOKEN: &str = "INFLUXDB_TOKEN";
const INFLUXDB_ORG: &str = "INFLUXDB_ORG";
const INFLUXDB_BUCKET: &str = "INFLUXDB_BUCKET";

const DEFAULT_INFLUXDB_URL: &str = "http://influxdb:8086";

const DATADRIVE: &str = "DATADRIVE";

const DEFAULT_DATADRIVE: &str = "./datadrive";

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

pub fn get_database_url() -> Option<String> {
    var(DATABASE_URL)
}

pub fn get_postgres_host() -> String {
    var(POSTGRES_HOST).unwrap_or_else(|| DEFAULT_POSTGRES_HOST.to_string())
}

/// `(user, password, database)` when all three are set
pub fn get_postgres_credentials() -> Option<(String, String, String)> {
    Some((
        var(POSTGRES_USER)?,
        var(POSTGRES_PASSWORD)?,
        var(POSTGRES_DATABASE)?,
    ))
}

pub fn get_influx_url() -> String {
    var(INFLUXDB_URL).unwrap_or_else(|| DEFAULT_INFLUXDB_URL.to_string())
}

pub fn get_influx_token() -> Option<String> {
    var(INFLUXDB_TOKEN)
}

pub fn get_influx_org() -> Option<String> {
    var(INFLUXDB_ORG)
}

pub fn get_influx_bucket() -> Option<String> {
    var(INFLUXDB_BUCKET)
}

pub fn get_datadrive() -> PathBuf {
    PathBuf::from(var(DATADRIVE).unwrap_or_else(|| DEFAULT_DATADRIVE.to_string()))
}

/// Names of the variables that are read, for error messages
pub fn postgres_variables() -> [&'static str; 3] {
    [POSTGRES_USER, POSTGRES_PASSWORD, POSTGRES_DATABASE]
}

pub fn influx_variables() -> [&'static str; 3] {
    [INFLUXDB_TOKEN, INFLUXDB_ORG, INFLUXDB_BUCKET]
}
