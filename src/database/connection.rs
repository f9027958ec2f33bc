use log::{debug, error};
use openssl::ssl::{SslConnector, SslMethod};
use postgres_openssl::MakeTlsConnector;
use tokio_postgres::{Client, NoTls};
use url::Url;

use crate::error::TransportError;

pub fn create_ssl_connector(sslrootcert_path: &str) -> Result<MakeTlsConnector, TransportError> {
    let mut builder = SslConnector::builder(SslMethod::tls())
        .map_err(|e| TransportError::Connection(format!("SSL builder error: {}", e)))?;

    builder
        .set_ca_file(sslrootcert_path)
        .map_err(|e| TransportError::Connection(format!("Error loading CA cert: {}", e)))?;

    Ok(MakeTlsConnector::new(builder.build()))
}

/// Split the `sslrootcert` query parameter off a connection URL.
///
/// libpq understands the parameter but tokio-postgres does not, so it is
/// removed from the URL and used to build the TLS connector instead.
pub fn split_sslrootcert(database_url: &str) -> Result<(String, Option<String>), TransportError> {
    let url = Url::parse(database_url)
        .map_err(|e| TransportError::Connection(format!("URL parse error: {}", e)))?;

    let mut sslrootcert_path = None;
    let mut clean_params = Vec::new();
    for (key, value) in url.query_pairs() {
        if key == "sslrootcert" {
            sslrootcert_path = Some(value.into_owned());
        } else {
            clean_params.push((key.into_owned(), value.into_owned()));
        }
    }

    let mut clean_url = url.clone();
    clean_url.set_query(None);
    if !clean_params.is_empty() {
        let query = clean_params
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join("&");
        clean_url.set_query(Some(&query));
    }

    Ok((clean_url.to_string(), sslrootcert_path))
}

/// Open one connection. TLS is used when the URL names a root certificate.
pub async fn connect(database_url: &str) -> Result<Client, TransportError> {
    let (clean_database_url, sslrootcert_path) = split_sslrootcert(database_url)?;

    let client = match sslrootcert_path {
        Some(path) => {
            let connector = create_ssl_connector(&path)?;
            let (client, connection) = tokio_postgres::connect(&clean_database_url, connector)
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
        None => {
            debug!("No sslrootcert given, connecting without TLS");
            let (client, connection) = tokio_postgres::connect(&clean_database_url, NoTls)
                .await
                .map_err(|e| TransportError::Connection(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    error!("Connection error: {}", e);
                }
            });
            client
        }
    };

    Ok(client)
}
