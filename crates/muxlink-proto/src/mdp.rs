//! Multiplex data protocol: endpoint-addressed envelopes over MFP.
//!
//! The MFP `data` buffer holds a JSON envelope `{endpoint, data?, error?,
//! filemap?}`; the MFP binaries map carries raw file bytes keyed identically
//! to the filemap triples.

use crate::codec;
use crate::error::{ProtoError, Result};
use crate::frame::{BinaryBody, BinaryScope, Frame, FrameBody, PayloadBody, ServiceCode};
use crate::id::IdGenerator;
use crate::mfp::MfpCodec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Per-send flags an endpoint or caller chooses.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameOptions {
    pub need_ack: bool,
    pub checksum: bool,
}

impl FrameOptions {
    pub fn acked() -> Self {
        Self {
            need_ack: true,
            checksum: false,
        }
    }
}

/// A named file attachment before encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlob {
    pub name: String,
    pub mime: String,
    pub bin: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filemap: Option<Vec<(u32, String, String)>>,
}

/// Decoded payload of an MDP message, request or response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MdpPayload {
    pub id: u32,
    pub endpoint: String,
    pub data: Option<Value>,
    pub error: Option<Value>,
    /// Attached files joined from the filemap and the binaries map.
    pub files: Option<BTreeMap<u32, FileBlob>>,
    /// Filemap triples announced ahead of binary frames (no bytes yet).
    pub filemap: Option<Vec<(u32, String, String)>>,
    pub expected: Option<BTreeSet<u32>>,
    pub streaming: bool,
    pub need_ack: bool,
}

/// One decoded MDP frame.
#[derive(Debug, Clone, PartialEq)]
pub enum MdpFrame {
    Service {
        id: u32,
        ref_id: u32,
        own_ref_id: bool,
        code: ServiceCode,
    },
    Message(MdpPayload),
    Request(MdpPayload),
    Response { ref_id: u32, payload: MdpPayload },
    Binary { id: u32, body: BinaryBody },
}

/// Encoder/decoder pairing the MFP codec with an id source.
pub struct MdpCodec {
    mfp: MfpCodec,
    ids: IdGenerator,
}

impl MdpCodec {
    pub fn new(mfp: MfpCodec) -> Self {
        Self {
            mfp,
            ids: IdGenerator::new(),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.ids.next_id()
    }

    // --- encode ---

    pub fn encode_ping(&self) -> Result<(u32, Vec<u8>)> {
        let id = self.next_id();
        Ok((id, self.mfp.encode(&Frame::ping(id))?))
    }

    pub fn encode_service(
        &self,
        ref_id: u32,
        own_ref_id: bool,
        code: ServiceCode,
    ) -> Result<(u32, Vec<u8>)> {
        let id = self.next_id();
        let frame = Frame::service(id, ref_id, own_ref_id, code);
        Ok((id, self.mfp.encode(&frame)?))
    }

    pub fn encode_message(
        &self,
        endpoint: &str,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        opts: FrameOptions,
    ) -> Result<(u32, Vec<u8>)> {
        let id = self.next_id();
        Ok((id, self.encode_message_with_id(id, endpoint, data, files, opts)?))
    }

    pub fn encode_message_with_id(
        &self,
        id: u32,
        endpoint: &str,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        opts: FrameOptions,
    ) -> Result<Vec<u8>> {
        let body = self.payload_body(endpoint, data, None, files, opts)?;
        self.mfp
            .encode(&Frame::message(id, body).with_checksum(opts.checksum))
    }

    pub fn encode_request(
        &self,
        endpoint: &str,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        opts: FrameOptions,
    ) -> Result<(u32, Vec<u8>)> {
        let id = self.next_id();
        Ok((id, self.encode_request_with_id(id, endpoint, data, files, opts)?))
    }

    pub fn encode_request_with_id(
        &self,
        id: u32,
        endpoint: &str,
        data: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        opts: FrameOptions,
    ) -> Result<Vec<u8>> {
        let body = self.payload_body(endpoint, data, None, files, opts)?;
        self.mfp
            .encode(&Frame::request(id, body).with_checksum(opts.checksum))
    }

    pub fn encode_response_with_id(
        &self,
        id: u32,
        ref_id: u32,
        endpoint: &str,
        data: Option<Value>,
        error: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        opts: FrameOptions,
    ) -> Result<Vec<u8>> {
        let body = self.payload_body(endpoint, data, error, files, opts)?;
        self.mfp
            .encode(&Frame::response(id, ref_id, body).with_checksum(opts.checksum))
    }

    /// Announce follow-up binary frames, either under a known key set or
    /// open-ended (`expected == None`).
    pub fn encode_announce(
        &self,
        endpoint: &str,
        data: Option<Value>,
        filemap: Option<Vec<(u32, String, String)>>,
        expected: Option<BTreeSet<u32>>,
        opts: FrameOptions,
    ) -> Result<(u32, Vec<u8>)> {
        let id = self.next_id();
        let envelope = Envelope {
            endpoint: validated_endpoint(endpoint)?,
            data,
            error: None,
            filemap,
        };
        let streaming = expected.is_none();
        let body = PayloadBody {
            data: Some(codec::encode_value(&envelope)?),
            expected,
            streaming,
            need_ack: opts.need_ack,
            ..Default::default()
        };
        let buf = self
            .mfp
            .encode(&Frame::message(id, body).with_checksum(opts.checksum))?;
        Ok((id, buf))
    }

    pub fn encode_binary_chunk(
        &self,
        ref_id: u32,
        scope: BinaryScope,
        bin: Option<Vec<u8>>,
        last: bool,
        opts: FrameOptions,
    ) -> Result<(u32, Vec<u8>)> {
        let id = self.next_id();
        let frame = Frame::binary(
            id,
            BinaryBody {
                ref_id,
                scope,
                bin,
                last,
                need_ack: opts.need_ack,
            },
        )
        .with_checksum(opts.checksum);
        Ok((id, self.mfp.encode(&frame)?))
    }

    fn payload_body(
        &self,
        endpoint: &str,
        data: Option<Value>,
        error: Option<Value>,
        files: Option<&BTreeMap<u32, FileBlob>>,
        opts: FrameOptions,
    ) -> Result<PayloadBody> {
        let filemap = files.map(|files| {
            files
                .iter()
                .map(|(key, file)| (*key, file.name.clone(), file.mime.clone()))
                .collect::<Vec<_>>()
        });
        let binaries = files.map(|files| {
            files
                .iter()
                .map(|(key, file)| (*key, file.bin.clone()))
                .collect::<BTreeMap<_, _>>()
        });
        let envelope = Envelope {
            endpoint: validated_endpoint(endpoint)?,
            data,
            error,
            filemap,
        };
        Ok(PayloadBody {
            data: Some(codec::encode_value(&envelope)?),
            binaries,
            need_ack: opts.need_ack,
            ..Default::default()
        })
    }

    // --- decode ---

    pub fn decode(&self, buf: &[u8]) -> Result<MdpFrame> {
        let frame = self.mfp.decode(buf)?;
        let id = frame.id;
        match frame.body {
            FrameBody::Service {
                ref_id,
                own_ref_id,
                code,
            } => Ok(MdpFrame::Service {
                id,
                ref_id,
                own_ref_id,
                code,
            }),
            FrameBody::Binary(body) => Ok(MdpFrame::Binary { id, body }),
            FrameBody::Message(body) => {
                Ok(MdpFrame::Message(self.decode_payload(id, body, false)?))
            }
            FrameBody::Request(body) => {
                Ok(MdpFrame::Request(self.decode_payload(id, body, true)?))
            }
            FrameBody::Response { ref_id, body } => Ok(MdpFrame::Response {
                ref_id,
                payload: self.decode_payload(id, body, false)?,
            }),
        }
    }

    fn decode_payload(&self, id: u32, body: PayloadBody, is_request: bool) -> Result<MdpPayload> {
        let data = body
            .data
            .ok_or_else(|| ProtoError::Unpack("payload frame carries no envelope".into()))?;
        let envelope: Envelope = codec::decode_value(&data)?;
        if envelope.endpoint.is_empty() {
            return Err(ProtoError::Unpack("empty endpoint name".into()));
        }
        if is_request && envelope.error.is_some() {
            return Err(ProtoError::Unpack(
                "request frames cannot carry an error field".into(),
            ));
        }

        let files = match (&body.binaries, &envelope.filemap) {
            (None, _) => None,
            (Some(binaries), Some(filemap)) => {
                if filemap.len() != binaries.len() {
                    return Err(ProtoError::Unpack(format!(
                        "filemap lists {} files, frame carries {}",
                        filemap.len(),
                        binaries.len()
                    )));
                }
                let mut files = BTreeMap::new();
                for (key, name, mime) in filemap {
                    let bin = binaries.get(key).ok_or_else(|| {
                        ProtoError::Unpack(format!("filemap key {} has no binary", key))
                    })?;
                    let previous = files.insert(
                        *key,
                        FileBlob {
                            name: name.clone(),
                            mime: mime.clone(),
                            bin: bin.clone(),
                        },
                    );
                    if previous.is_some() {
                        return Err(ProtoError::Unpack(format!("duplicate filemap key {}", key)));
                    }
                }
                Some(files)
            }
            (Some(_), None) => {
                return Err(ProtoError::Unpack(
                    "frame carries binaries but no filemap".into(),
                ))
            }
        };

        let filemap = if files.is_some() {
            None
        } else {
            envelope.filemap
        };
        Ok(MdpPayload {
            id,
            endpoint: envelope.endpoint,
            data: envelope.data,
            error: envelope.error,
            files,
            filemap,
            expected: body.expected,
            streaming: body.streaming,
            need_ack: body.need_ack,
        })
    }
}

fn validated_endpoint(endpoint: &str) -> Result<String> {
    if endpoint.is_empty() {
        return Err(ProtoError::Pack("empty endpoint name".into()));
    }
    Ok(endpoint.to_string())
}
