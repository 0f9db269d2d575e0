//! TS control messages.
//!
//! Every control message starts with a `u16` command type. The version
//! negotiation command has the same layout under every protocol version;
//! all other commands are decoded with the layout of the negotiated
//! version. Version 0 and version 1 layouts are not compatible.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::constants::protocol::VALID_MAGIC_NUM;
use crate::dispatch::model::LoadSpec;
use crate::error::{Result, SchedError};

pub const MSG_VERSION_0: u16 = 0;
pub const MSG_VERSION_1: u16 = 1;

/// Command type ids.
mod cmd {
    pub const MODEL_OPERATE: u16 = 0;
    pub const TASK_REPORT: u16 = 1;
    pub const NOTIFY_RECORD: u16 = 2;
    pub const DUMP_DATA: u16 = 3;
    pub const DUMP_MAPPING_INFO: u16 = 4;
    pub const TIMEOUT_CONFIG: u16 = 5;
    pub const PLATFORM_INFO_LOAD: u16 = 6;
    pub const AIC_ERROR_REPORT: u16 = 7;
    pub const MSG_VERSION: u16 = 8;
    /// Version 1 only.
    pub const DUMP_DATA_DEBUG: u16 = 9;
}

/// Model operations carried by a model-operate command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelOp {
    Load(LoadSpec),
    Execute,
    Abort,
    Destroy,
}

impl ModelOp {
    fn raw(&self) -> u32 {
        match self {
            ModelOp::Load(_) => 0,
            ModelOp::Execute => 1,
            ModelOp::Abort => 2,
            ModelOp::Destroy => 3,
        }
    }
}

/// A decoded control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMsg {
    ModelOperate {
        model_id: u32,
        op: ModelOp,
    },
    TaskReport {
        model_id: u32,
        stream_id: u32,
        task_id: u32,
        result_code: u32,
    },
    NotifyRecord {
        notify_id: u32,
    },
    DumpData {
        debug: bool,
        body: Bytes,
    },
    DumpMappingInfo {
        body: Bytes,
    },
    TimeoutConfig {
        op_execute_timeout: u32,
        op_wait_timeout: u32,
    },
    PlatformInfoLoad {
        body: Bytes,
    },
    AicErrorReport {
        model_id: u32,
        stream_id: u32,
        task_id: u32,
        result_code: u32,
        /// Failing AI-core and vector-core bitmaps (version 1 only).
        core_bitmaps: Option<(u64, u64)>,
    },
    MsgVersion {
        magic: u16,
        version: u16,
    },
}

fn need(buf: &[u8], n: usize) -> Result<()> {
    if buf.remaining() < n {
        return Err(SchedError::ParameterInvalid(format!(
            "control message truncated: need {} bytes, have {}",
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_body(buf: &mut &[u8]) -> Result<Bytes> {
    need(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    need(buf, len)?;
    let body = Bytes::copy_from_slice(&buf[..len]);
    buf.advance(len);
    Ok(body)
}

fn put_body(buf: &mut BytesMut, body: &[u8]) {
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(body);
}

impl ControlMsg {
    /// Command type of a raw message, without decoding the rest.
    pub fn peek_cmd(buf: &[u8]) -> Result<u16> {
        need(buf, 2)?;
        Ok((&buf[..2]).get_u16_le())
    }

    /// Decode a version negotiation message.
    pub fn decode_version(mut buf: &[u8]) -> Result<ControlMsg> {
        need(buf, 6)?;
        buf.advance(2);
        let magic = buf.get_u16_le();
        let version = buf.get_u16_le();
        Ok(ControlMsg::MsgVersion { magic, version })
    }

    /// Decode with the layout of `version`.
    pub fn decode(buf: &[u8], version: u16) -> Result<ControlMsg> {
        if Self::peek_cmd(buf)? == cmd::MSG_VERSION {
            return Self::decode_version(buf);
        }
        match version {
            MSG_VERSION_0 => Self::decode_v0(buf),
            MSG_VERSION_1 => Self::decode_v1(buf),
            other => Err(SchedError::NotFoundVersion(other)),
        }
    }

    fn decode_v0(mut buf: &[u8]) -> Result<ControlMsg> {
        need(buf, 4)?;
        let cmd_type = buf.get_u16_le();
        let aux = buf.get_u16_le();
        debug!("Decoding v0 control command {}", cmd_type);
        let msg = match cmd_type {
            cmd::MODEL_OPERATE => {
                need(buf, 4)?;
                let model_id = buf.get_u32_le();
                let op = Self::model_op(u32::from(aux), &mut buf)?;
                ControlMsg::ModelOperate { model_id, op }
            }
            cmd::TASK_REPORT => {
                need(buf, 16)?;
                let model_id = buf.get_u32_le();
                let stream_id = buf.get_u32_le();
                let task_id = buf.get_u32_le();
                let result_code = u32::from(buf.get_u16_le());
                buf.advance(2);
                ControlMsg::TaskReport { model_id, stream_id, task_id, result_code }
            }
            cmd::NOTIFY_RECORD => {
                need(buf, 4)?;
                ControlMsg::NotifyRecord { notify_id: buf.get_u32_le() }
            }
            cmd::DUMP_DATA => ControlMsg::DumpData { debug: false, body: get_body(&mut buf)? },
            cmd::DUMP_MAPPING_INFO => ControlMsg::DumpMappingInfo { body: get_body(&mut buf)? },
            cmd::TIMEOUT_CONFIG => {
                need(buf, 8)?;
                let op_execute_timeout = buf.get_u32_le();
                let op_wait_timeout = buf.get_u32_le();
                ControlMsg::TimeoutConfig { op_execute_timeout, op_wait_timeout }
            }
            cmd::PLATFORM_INFO_LOAD => ControlMsg::PlatformInfoLoad { body: get_body(&mut buf)? },
            cmd::AIC_ERROR_REPORT => {
                need(buf, 16)?;
                ControlMsg::AicErrorReport {
                    model_id: buf.get_u32_le(),
                    stream_id: buf.get_u32_le(),
                    task_id: buf.get_u32_le(),
                    result_code: buf.get_u32_le(),
                    core_bitmaps: None,
                }
            }
            other => return Err(SchedError::NotFoundCmdType(u32::from(other))),
        };
        Ok(msg)
    }

    fn decode_v1(mut buf: &[u8]) -> Result<ControlMsg> {
        need(buf, 4)?;
        let cmd_type = buf.get_u16_le();
        buf.advance(2);
        debug!("Decoding v1 control command {}", cmd_type);
        let msg = match cmd_type {
            cmd::MODEL_OPERATE => {
                need(buf, 8)?;
                let model_id = buf.get_u32_le();
                let op = buf.get_u32_le();
                let op = Self::model_op(op, &mut buf)?;
                ControlMsg::ModelOperate { model_id, op }
            }
            cmd::TASK_REPORT => {
                need(buf, 16)?;
                let result_code = buf.get_u32_le();
                let task_id = buf.get_u32_le();
                let stream_id = buf.get_u32_le();
                let model_id = buf.get_u32_le();
                ControlMsg::TaskReport { model_id, stream_id, task_id, result_code }
            }
            cmd::NOTIFY_RECORD => {
                need(buf, 8)?;
                buf.advance(4);
                ControlMsg::NotifyRecord { notify_id: buf.get_u32_le() }
            }
            cmd::DUMP_DATA => ControlMsg::DumpData { debug: false, body: get_body(&mut buf)? },
            cmd::DUMP_DATA_DEBUG => ControlMsg::DumpData { debug: true, body: get_body(&mut buf)? },
            cmd::DUMP_MAPPING_INFO => ControlMsg::DumpMappingInfo { body: get_body(&mut buf)? },
            cmd::TIMEOUT_CONFIG => {
                need(buf, 12)?;
                let op_wait_timeout = buf.get_u32_le();
                let op_execute_timeout = buf.get_u32_le();
                buf.advance(4);
                ControlMsg::TimeoutConfig { op_execute_timeout, op_wait_timeout }
            }
            cmd::PLATFORM_INFO_LOAD => ControlMsg::PlatformInfoLoad { body: get_body(&mut buf)? },
            cmd::AIC_ERROR_REPORT => {
                need(buf, 32)?;
                ControlMsg::AicErrorReport {
                    model_id: buf.get_u32_le(),
                    stream_id: buf.get_u32_le(),
                    task_id: buf.get_u32_le(),
                    result_code: buf.get_u32_le(),
                    core_bitmaps: Some((buf.get_u64_le(), buf.get_u64_le())),
                }
            }
            other => return Err(SchedError::NotFoundCmdType(u32::from(other))),
        };
        Ok(msg)
    }

    fn model_op(op: u32, buf: &mut &[u8]) -> Result<ModelOp> {
        match op {
            0 => Ok(ModelOp::Load(LoadSpec::decode(buf)?)),
            1 => Ok(ModelOp::Execute),
            2 => Ok(ModelOp::Abort),
            3 => Ok(ModelOp::Destroy),
            other => Err(SchedError::NotFoundCmdType(other)),
        }
    }

    /// Encode with the layout of `version`; the TS side of the protocol.
    pub fn encode(&self, version: u16) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        let v1 = version == MSG_VERSION_1;
        match self {
            ControlMsg::ModelOperate { model_id, op } => {
                buf.put_u16_le(cmd::MODEL_OPERATE);
                if v1 {
                    buf.put_u16_le(0);
                    buf.put_u32_le(*model_id);
                    buf.put_u32_le(op.raw());
                } else {
                    buf.put_u16_le(op.raw() as u16);
                    buf.put_u32_le(*model_id);
                }
                if let ModelOp::Load(spec) = op {
                    spec.encode(&mut buf);
                }
            }
            ControlMsg::TaskReport { model_id, stream_id, task_id, result_code } => {
                buf.put_u16_le(cmd::TASK_REPORT);
                buf.put_u16_le(0);
                if v1 {
                    buf.put_u32_le(*result_code);
                    buf.put_u32_le(*task_id);
                    buf.put_u32_le(*stream_id);
                    buf.put_u32_le(*model_id);
                } else {
                    buf.put_u32_le(*model_id);
                    buf.put_u32_le(*stream_id);
                    buf.put_u32_le(*task_id);
                    buf.put_u16_le(*result_code as u16);
                    buf.put_u16_le(0);
                }
            }
            ControlMsg::NotifyRecord { notify_id } => {
                buf.put_u16_le(cmd::NOTIFY_RECORD);
                buf.put_u16_le(0);
                if v1 {
                    buf.put_u32_le(0);
                }
                buf.put_u32_le(*notify_id);
            }
            ControlMsg::DumpData { debug, body } => {
                let id = if *debug && v1 { cmd::DUMP_DATA_DEBUG } else { cmd::DUMP_DATA };
                buf.put_u16_le(id);
                buf.put_u16_le(0);
                put_body(&mut buf, body);
            }
            ControlMsg::DumpMappingInfo { body } => {
                buf.put_u16_le(cmd::DUMP_MAPPING_INFO);
                buf.put_u16_le(0);
                put_body(&mut buf, body);
            }
            ControlMsg::TimeoutConfig { op_execute_timeout, op_wait_timeout } => {
                buf.put_u16_le(cmd::TIMEOUT_CONFIG);
                buf.put_u16_le(0);
                if v1 {
                    buf.put_u32_le(*op_wait_timeout);
                    buf.put_u32_le(*op_execute_timeout);
                    buf.put_u32_le(0);
                } else {
                    buf.put_u32_le(*op_execute_timeout);
                    buf.put_u32_le(*op_wait_timeout);
                }
            }
            ControlMsg::PlatformInfoLoad { body } => {
                buf.put_u16_le(cmd::PLATFORM_INFO_LOAD);
                buf.put_u16_le(0);
                put_body(&mut buf, body);
            }
            ControlMsg::AicErrorReport { model_id, stream_id, task_id, result_code, core_bitmaps } => {
                buf.put_u16_le(cmd::AIC_ERROR_REPORT);
                buf.put_u16_le(0);
                buf.put_u32_le(*model_id);
                buf.put_u32_le(*stream_id);
                buf.put_u32_le(*task_id);
                buf.put_u32_le(*result_code);
                if v1 {
                    let (aic, aiv) = core_bitmaps.unwrap_or_default();
                    buf.put_u64_le(aic);
                    buf.put_u64_le(aiv);
                }
            }
            ControlMsg::MsgVersion { magic, version } => {
                buf.put_u16_le(cmd::MSG_VERSION);
                buf.put_u16_le(*magic);
                buf.put_u16_le(*version);
            }
        }
        buf.freeze()
    }

    /// Version negotiation message as sent by TS.
    pub fn version(version: u16) -> ControlMsg {
        ControlMsg::MsgVersion {
            magic: VALID_MAGIC_NUM,
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::model::StreamSpec;

    #[test]
    fn test_layouts_differ_between_versions() {
        let report = ControlMsg::TaskReport {
            model_id: 1,
            stream_id: 2,
            task_id: 3,
            result_code: 4,
        };
        let v0 = report.encode(MSG_VERSION_0);
        let v1 = report.encode(MSG_VERSION_1);
        assert_ne!(v0, v1);
        assert_eq!(ControlMsg::decode(&v0, 0).unwrap(), report);
        assert_eq!(ControlMsg::decode(&v1, 1).unwrap(), report);
        // Decoding with the wrong layout scrambles the fields.
        assert_ne!(ControlMsg::decode(&v1, 0).unwrap(), report);
    }

    #[test]
    fn test_load_body() {
        let msg = ControlMsg::ModelOperate {
            model_id: 9,
            op: ModelOp::Load(LoadSpec {
                ts_context: 2,
                streams: vec![StreamSpec { stream_id: 30, flag: 1 }],
                queues: vec![5, 6],
                repeat: true,
            }),
        };
        for version in [MSG_VERSION_0, MSG_VERSION_1] {
            assert_eq!(ControlMsg::decode(&msg.encode(version), version).unwrap(), msg);
        }
    }

    #[test]
    fn test_version_message_is_layout_independent() {
        let bytes = ControlMsg::version(1).encode(0);
        assert_eq!(ControlMsg::decode(&bytes, 7).unwrap(), ControlMsg::version(1));
    }

    #[test]
    fn test_unknown_version_and_command() {
        let bytes = ControlMsg::NotifyRecord { notify_id: 1 }.encode(0);
        assert!(matches!(ControlMsg::decode(&bytes, 5), Err(SchedError::NotFoundVersion(5))));

        let mut raw = BytesMut::new();
        raw.put_u16_le(0x77);
        raw.put_u16_le(0);
        assert!(matches!(
            ControlMsg::decode(&raw, 0),
            Err(SchedError::NotFoundCmdType(0x77))
        ));

        let mut raw = BytesMut::new();
        raw.put_u16_le(cmd::MODEL_OPERATE);
        raw.put_u16_le(9);
        raw.put_u32_le(1);
        assert!(matches!(ControlMsg::decode(&raw, 0), Err(SchedError::NotFoundCmdType(9))));
    }

    #[test]
    fn test_debug_dump_only_in_v1() {
        let msg = ControlMsg::DumpData {
            debug: true,
            body: Bytes::from_static(b"abc"),
        };
        assert_eq!(ControlMsg::decode(&msg.encode(1), 1).unwrap(), msg);
        assert!(matches!(
            ControlMsg::decode(&msg.encode(1), 0),
            Err(SchedError::NotFoundCmdType(9))
        ));
    }

    #[test]
    fn test_truncated() {
        assert!(ControlMsg::decode(&[], 0).is_err());
        let bytes = ControlMsg::TimeoutConfig { op_execute_timeout: 1, op_wait_timeout: 2 }.encode(1);
        assert!(matches!(
            ControlMsg::decode(&bytes[..8], 1),
            Err(SchedError::ParameterInvalid(_))
        ));
    }
}
