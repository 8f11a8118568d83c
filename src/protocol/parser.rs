use std::io::Cursor;

use byteorder::{BigEndian, LittleEndian, ReadBytesExt};

use crate::packet_buffer::read_varint_safe;
use crate::protocol::layout::{DamageLayout, FieldKind, FieldSpec, NicknameLayout, ProtocolLayout};
use crate::protocol::types::{DamageEvent, DecodedEvent};

/// Result of parsing one complete frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedFrame {
    Event(DecodedEvent),
    /// Structurally fine, but not a message we track.
    Ignored { opcode: u64 },
    /// Opcode matched but a field ran past the end of the frame.
    Malformed { opcode: u64 },
}

// --- STAGE 1: ROUTE ---
// Reads the opcode and hands the frame to the matching field mapper.
pub fn parse_frame(layout: &ProtocolLayout, frame: &[u8]) -> ParsedFrame {
    let opcode = match read_field(layout.opcode, frame) {
        Some((value, _)) => value,
        None => return ParsedFrame::Malformed { opcode: 0 },
    };

    let parsed = if opcode == layout.damage.opcode_value {
        parse_damage(&layout.damage, frame).map(DecodedEvent::Damage)
    } else {
        match &layout.nickname {
            Some(nick) if opcode == nick.opcode_value => parse_nickname(nick, frame),
            _ => return ParsedFrame::Ignored { opcode },
        }
    };

    match parsed {
        Some(event) => ParsedFrame::Event(event),
        None => ParsedFrame::Malformed { opcode },
    }
}

// --- STAGE 2: STRICT MAPPED PARSERS ---

fn parse_damage(layout: &DamageLayout, frame: &[u8]) -> Option<DamageEvent> {
    let (attacker, _) = read_field(layout.attacker, frame)?;
    let (target, _) = read_field(layout.target, frame)?;
    let (skill, _) = read_field(layout.skill, frame)?;
    let (amount, _) = read_field(layout.amount, frame)?;

    let crit = match layout.crit {
        Some(spec) => read_field(spec, frame)?.0 & layout.crit_mask != 0,
        None => false,
    };

    Some(DamageEvent {
        attacker,
        target,
        skill: u32::try_from(skill).ok()?,
        amount,
        crit,
    })
}

fn parse_nickname(layout: &NicknameLayout, frame: &[u8]) -> Option<DecodedEvent> {
    let (entity, _) = read_field(layout.entity, frame)?;
    let (len, name_start) = read_field(layout.name_length, frame)?;
    let name_end = name_start.checked_add(usize::try_from(len).ok()?)?;
    let raw = frame.get(name_start..name_end)?;

    let name = String::from_utf8_lossy(raw).trim_end_matches('\0').to_string();
    if name.is_empty() {
        return None;
    }
    Some(DecodedEvent::Nickname { entity, name })
}

// ==========================================
// PARSING & UTILITIES
// ==========================================

/// Reads one field, returning its value and the offset just past it.
/// `None` if the frame ends before the field does.
pub(crate) fn read_field(spec: FieldSpec, data: &[u8]) -> Option<(u64, usize)> {
    let bytes = data.get(spec.offset..)?;
    let mut cursor = Cursor::new(bytes);

    let value = match spec.kind {
        FieldKind::U8 => cursor.read_u8().map(u64::from),
        FieldKind::U16Le => cursor.read_u16::<LittleEndian>().map(u64::from),
        FieldKind::U16Be => cursor.read_u16::<BigEndian>().map(u64::from),
        FieldKind::U32Le => cursor.read_u32::<LittleEndian>().map(u64::from),
        FieldKind::U32Be => cursor.read_u32::<BigEndian>().map(u64::from),
        FieldKind::U64Le => cursor.read_u64::<LittleEndian>(),
        FieldKind::U64Be => cursor.read_u64::<BigEndian>(),
        FieldKind::Varint => {
            let (value, read) = read_varint_safe(bytes);
            // (0, 0) means the varint is cut off
            return (read > 0).then_some((value, spec.offset + read));
        }
    }
    .ok()?;

    Some((value, spec.offset + cursor.position() as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::test_support::{damage_frame, nickname_frame, test_layout, DAMAGE_OPCODE};

    #[test]
    fn parses_damage_frame() {
        let layout = test_layout();
        let event = DamageEvent { attacker: 7, target: 900, skill: 11_020_001, amount: 123_456, crit: true };

        let frame = damage_frame(&event);
        assert_eq!(parse_frame(&layout, &frame), ParsedFrame::Event(DecodedEvent::Damage(event)));
    }

    #[test]
    fn unknown_skill_code_still_parses() {
        let layout = test_layout();
        let event = DamageEvent { attacker: 1, target: 2, skill: 42, amount: 0, crit: false };

        let frame = damage_frame(&event);
        assert_eq!(parse_frame(&layout, &frame), ParsedFrame::Event(DecodedEvent::Damage(event)));
    }

    #[test]
    fn parses_nickname_frame() {
        let layout = test_layout();
        let frame = nickname_frame(7, "무명검사");
        assert_eq!(
            parse_frame(&layout, &frame),
            ParsedFrame::Event(DecodedEvent::Nickname { entity: 7, name: "무명검사".into() })
        );
    }

    #[test]
    fn other_opcodes_are_ignored() {
        let layout = test_layout();
        let mut frame = damage_frame(&DamageEvent { attacker: 1, target: 2, skill: 3, amount: 4, crit: false });
        frame[4] = 0xEE;
        frame[5] = 0xEE;
        assert_eq!(parse_frame(&layout, &frame), ParsedFrame::Ignored { opcode: 0xEEEE });
    }

    #[test]
    fn truncated_damage_frame_is_malformed() {
        let layout = test_layout();
        let frame = damage_frame(&DamageEvent { attacker: 1, target: 2, skill: 3, amount: 4, crit: false });
        assert_eq!(parse_frame(&layout, &frame[..12]), ParsedFrame::Malformed { opcode: DAMAGE_OPCODE });
    }

    #[test]
    fn read_field_respects_endianness() {
        let data = [0x12, 0x34, 0x56, 0x78];
        let le = FieldSpec { offset: 0, kind: FieldKind::U16Le };
        let be = FieldSpec { offset: 0, kind: FieldKind::U16Be };
        let wide = FieldSpec { offset: 0, kind: FieldKind::U32Be };
        assert_eq!(read_field(le, &data), Some((0x3412, 2)));
        assert_eq!(read_field(be, &data), Some((0x1234, 2)));
        assert_eq!(read_field(wide, &data), Some((0x1234_5678, 4)));
        assert_eq!(read_field(FieldSpec { offset: 3, kind: FieldKind::U16Le }, &data), None);
        assert_eq!(read_field(FieldSpec { offset: 9, kind: FieldKind::U8 }, &data), None);
    }

    #[test]
    fn read_field_varint_needs_terminator() {
        let spec = FieldSpec { offset: 1, kind: FieldKind::Varint };
        assert_eq!(read_field(spec, &[0x00, 0xAC, 0x02]), Some((300, 3)));
        assert_eq!(read_field(spec, &[0x00, 0xAC]), None);
    }
}
