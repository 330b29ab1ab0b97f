use tokio::net::TcpStream;

use crate::api::{read_frame, write_frame, DumpEntry, DumpRequest, DUMP_METHOD};
use crate::{Error, Result};

/// Typed client for the introspection endpoint; what the doctor CLI
/// and the tests dial in with.
pub struct Client {
    stream: TcpStream,
}

impl Client {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Rpc(format!("failed to dial {addr}: {e}")))?;
        Ok(Self { stream })
    }

    /// Fetch the named bucket's snapshot. Unknown names come back as an
    /// empty list, mirroring the server contract.
    pub async fn dump(&mut self, bucket_name: &str) -> Result<Vec<DumpEntry>> {
        let request = DumpRequest {
            method: DUMP_METHOD.to_string(),
            bucket_name: bucket_name.to_string(),
        };
        let payload =
            serde_json::to_vec(&request).map_err(|e| Error::Rpc(format!("encode: {e}")))?;
        write_frame(&mut self.stream, &payload)
            .await
            .map_err(|e| Error::Rpc(format!("send: {e}")))?;

        let reply = read_frame(&mut self.stream)
            .await
            .map_err(|e| Error::Rpc(format!("receive: {e}")))?
            .ok_or_else(|| Error::Rpc("server closed the connection".to_string()))?;
        serde_json::from_slice(&reply).map_err(|e| Error::Rpc(format!("decode: {e}")))
    }
}
