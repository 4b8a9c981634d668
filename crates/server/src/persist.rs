//! Channel blocks and server snapshots.
//!
//! A channel block is the unit of both hibernation and persistence:
//!
//! ```text
//! [u16 version][str level][blob data][u32 next object id][opt str password]
//! [u8 persistent][u16 player limit]
//! [u32 n] n x [u32 uid][opt str function name][blob payload]
//! [u32 n] n x [u32 owner][u32 id][u8 persistence][u32 type index][blob payload]
//! [u32 n] n x [u32 destroyed static id]
//! [u8 locked]
//! ```
//!
//! A snapshot wraps the blocks of every persistent channel behind a
//! magic/version/CRC32 header so foreign or damaged files are rejected.

use crate::channel::{ChannelLedgers, ChannelSettings};
use crate::error::PersistError;
use crate::objects::CreatedObject;
use bytes::Bytes;
use crc32fast::Hasher;
use tether_net::{
    ChannelId, DataTree, ObjectPersistence, PacketBuffer, PacketReader, RfcKey,
    FIRST_DYNAMIC_OBJECT_ID, MAX_OBJECT_ID,
};

/// Current channel block format version.
pub const CHANNEL_FORMAT_VERSION: u16 = 1;

/// Snapshot magic ("TTHR").
const SNAPSHOT_MAGIC: u32 = 0x5454_4852;

/// Current snapshot format version.
const SNAPSHOT_VERSION: u16 = 1;

/// Snapshot header: magic, version, crc32, payload length.
const SNAPSHOT_HEADER_SIZE: usize = 4 + 2 + 4 + 4;

fn count(len: usize) -> Result<u32, PersistError> {
    u32::try_from(len).map_err(|_| PersistError::Buffer(tether_net::BufferError::TooLarge(len)))
}

/// Serialize a channel's settings and ledgers into a block.
pub fn encode_channel_block(
    settings: &ChannelSettings,
    ledgers: &ChannelLedgers,
) -> Result<Bytes, PersistError> {
    let mut buf = PacketBuffer::new();
    buf.write_u16(CHANNEL_FORMAT_VERSION);
    buf.write_str(&settings.level)?;
    buf.write_blob(ledgers.data.as_bytes())?;
    buf.write_u32(ledgers.objects.next_id());
    buf.write_opt_str(settings.password.as_deref())?;
    buf.write_bool(settings.persistent);
    buf.write_u16(settings.player_limit);

    buf.write_u32(count(ledgers.rfcs.len())?);
    for rfc in ledgers.rfcs.iter() {
        buf.write_u32(rfc.key.uid());
        let name = if rfc.key.function_id == 0 {
            rfc.key.function_name.as_deref()
        } else {
            None
        };
        buf.write_opt_str(name)?;
        buf.write_blob(&rfc.payload)?;
    }

    buf.write_u32(count(ledgers.objects.len())?);
    for object in ledgers.objects.iter() {
        buf.write_u32(object.owner);
        buf.write_u32(object.object_id);
        buf.write_u8(object.persistence.as_u8());
        buf.write_u32(object.type_index);
        buf.write_blob(&object.payload)?;
    }

    let destroyed: Vec<_> = ledgers.objects.destroyed().collect();
    buf.write_u32(count(destroyed.len())?);
    for id in destroyed {
        buf.write_u32(id);
    }

    buf.write_bool(settings.locked);
    Ok(buf.freeze())
}

/// Parse a block produced by [`encode_channel_block`].
pub fn decode_channel_block(
    block: Bytes,
) -> Result<(ChannelSettings, ChannelLedgers), PersistError> {
    let mut r = PacketReader::new(block);
    let version = r.read_u16()?;
    if version != CHANNEL_FORMAT_VERSION {
        return Err(PersistError::UnsupportedVersion(version));
    }

    let level = r.read_string()?;
    let data = DataTree(r.read_blob()?);
    let next_id = r.read_u32()?;
    let password = r.read_opt_string()?;
    let persistent = r.read_bool()?;
    let player_limit = r.read_u16()?;

    let mut ledgers = ChannelLedgers {
        data,
        ..ChannelLedgers::default()
    };
    ledgers.objects.set_next_id(next_id);

    for _ in 0..r.read_u32()? {
        let (object_id, function_id) = RfcKey::split_uid(r.read_u32()?);
        let function_name = r.read_opt_string()?;
        let payload = r.read_blob()?;
        ledgers.rfcs.add(
            RfcKey {
                object_id,
                function_id,
                function_name,
            },
            payload,
        );
    }

    for _ in 0..r.read_u32()? {
        let owner = r.read_u32()?;
        let object_id = r.read_u32()?;
        if !(FIRST_DYNAMIC_OBJECT_ID..=MAX_OBJECT_ID).contains(&object_id) {
            return Err(PersistError::InvalidObjectId(object_id));
        }
        let raw = r.read_u8()?;
        let persistence =
            ObjectPersistence::from_u8(raw).ok_or(PersistError::InvalidPersistence(raw))?;
        let type_index = r.read_u32()?;
        let payload = r.read_blob()?;
        ledgers.objects.insert(CreatedObject {
            owner,
            object_id,
            persistence,
            type_index,
            payload,
        });
    }

    for _ in 0..r.read_u32()? {
        ledgers.objects.mark_destroyed(r.read_u32()?);
    }

    let locked = r.read_bool()?;
    let settings = ChannelSettings {
        password,
        level,
        persistent,
        player_limit,
        locked,
    };
    Ok((settings, ledgers))
}

/// Wrap channel blocks into a checksummed snapshot.
pub fn encode_snapshot(channels: &[(ChannelId, Bytes)]) -> Result<Bytes, PersistError> {
    let mut payload = PacketBuffer::new();
    payload.write_u32(count(channels.len())?);
    for (id, block) in channels {
        payload.write_u32(*id);
        payload.write_blob(block)?;
    }
    let payload = payload.freeze();

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc32 = hasher.finalize();

    let mut out = PacketBuffer::new();
    out.write_u32(SNAPSHOT_MAGIC);
    out.write_u16(SNAPSHOT_VERSION);
    out.write_u32(crc32);
    out.write_u32(count(payload.len())?);
    out.write_raw(&payload);
    Ok(out.freeze())
}

/// Validate a snapshot and split it back into `(channel id, block)` pairs.
pub fn decode_snapshot(bytes: Bytes) -> Result<Vec<(ChannelId, Bytes)>, PersistError> {
    let total = bytes.len();
    if total < SNAPSHOT_HEADER_SIZE {
        return Err(PersistError::Truncated(total));
    }
    let available = total - SNAPSHOT_HEADER_SIZE;
    let mut header = PacketReader::new(bytes);
    let magic = header.read_u32()?;
    if magic != SNAPSHOT_MAGIC {
        return Err(PersistError::BadMagic(magic));
    }
    let version = header.read_u16()?;
    if version != SNAPSHOT_VERSION {
        return Err(PersistError::UnsupportedVersion(version));
    }
    let expected = header.read_u32()?;
    let len = header.read_u32()? as usize;
    if len > available {
        return Err(PersistError::Truncated(total));
    }
    if len < available {
        return Err(PersistError::TrailingBytes(available - len));
    }
    let payload = header.read_raw(len)?;

    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(PersistError::Checksum { expected, actual });
    }

    let mut r = PacketReader::new(payload);
    let n = r.read_u32()?;
    let mut channels = Vec::with_capacity(n.min(1024) as usize);
    for _ in 0..n {
        let id = r.read_u32()?;
        let block = r.read_blob()?;
        channels.push((id, block));
    }
    Ok(channels)
}
