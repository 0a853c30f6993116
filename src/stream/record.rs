use std::collections::BTreeMap;

use serde::Serialize;

use crate::broker::StreamEntry;

const TEMP_ID: &str = "tempId";
const ROOM_ID: &str = "roomId";
const FROM_UID: &str = "fromUid";
const CONTENT: &str = "content";
const TYPE: &str = "type";
const EXTRA: &str = "extra";

/// 死信流记录 / Dead-letter stream record
///
/// 字段均为字符串；未识别的字段保留在 `other` 中
/// Fields stay strings; unrecognised keys are kept in `other`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamRecord {
    /// 代理分配的 ID，写入前为空 / Broker-assigned id, empty before append
    pub record_id: Option<String>,
    pub temp_id: Option<String>,
    pub room_id: Option<String>,
    pub from_uid: Option<String>,
    pub content: Option<String>,
    pub msg_type: Option<String>,
    pub extra: Option<String>,
    pub other: BTreeMap<String, String>,
}

impl StreamRecord {
    pub fn from_fields(record_id: Option<String>, mut fields: BTreeMap<String, String>) -> Self {
        Self {
            record_id,
            temp_id: fields.remove(TEMP_ID),
            room_id: fields.remove(ROOM_ID),
            from_uid: fields.remove(FROM_UID),
            content: fields.remove(CONTENT),
            msg_type: fields.remove(TYPE),
            extra: fields.remove(EXTRA),
            other: fields,
        }
    }

    /// 转为线上字段对 / Flatten to wire field pairs
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let known = [
            (TEMP_ID, &self.temp_id),
            (ROOM_ID, &self.room_id),
            (FROM_UID, &self.from_uid),
            (CONTENT, &self.content),
            (TYPE, &self.msg_type),
            (EXTRA, &self.extra),
        ];
        known
            .into_iter()
            .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
            .chain(self.other.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}

impl From<StreamEntry> for StreamRecord {
    fn from(entry: StreamEntry) -> Self {
        StreamRecord::from_fields(Some(entry.id), entry.fields)
    }
}
