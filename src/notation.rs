//! Algebraic notation: encoding committed moves and decoding them back.
//!
//! Encoded notation follows standard algebraic notation with a few house
//! conventions clients rely on: castling is written with zeros (`0-0`,
//! `0-0-0`) and an en passant capture carries a trailing ` e.p.` after any
//! check marker. The decoder accepts the same strings plus the common
//! variants (`O-O`, `e8Q`, missing `x`).

use crate::error::{EngineError, EngineResult};
use crate::movegen;
use crate::position::Position;
use crate::types::*;

/// Suffix appended to en passant captures.
const EN_PASSANT_SUFFIX: &str = " e.p.";

/// Encodes `mv`, played from `pos`, as algebraic notation.
///
/// `mv` must be legal in `pos` (as returned by [`movegen::validate_move`]).
/// The check and mate markers are derived from the resulting position.
pub fn to_algebraic(pos: &Position, mv: &ChessMove) -> String {
    let mut san = String::new();

    match mv.castle_side() {
        Some(CastleSide::Kingside) => san.push_str("0-0"),
        Some(CastleSide::Queenside) => san.push_str("0-0-0"),
        None => {
            let kind = pos
                .board
                .get(mv.from)
                .map(|p| p.kind)
                .unwrap_or(PieceKind::Pawn);
            let is_capture = movegen::captured_piece(pos, mv).is_some();

            if kind == PieceKind::Pawn {
                if is_capture {
                    san.push(mv.from.file_char());
                }
            } else {
                san.push(kind.letter());
                if let Some(dup) = movegen::find_duplicate_movement(pos, mv) {
                    if !dup.same_file {
                        san.push(mv.from.file_char());
                    } else if !dup.same_rank {
                        san.push(mv.from.rank_char());
                    } else {
                        san.push(mv.from.file_char());
                        san.push(mv.from.rank_char());
                    }
                }
            }

            if is_capture {
                san.push('x');
            }
            san.push_str(&mv.to.to_algebraic());

            if let Some(promo) = mv.promotion {
                san.push('=');
                san.push(promo.letter());
            }
        }
    }

    let after = movegen::apply_move(pos, mv);
    if movegen::is_checkmate(&after, after.turn) {
        san.push('#');
    } else if after.in_check() {
        san.push('+');
    }

    if mv.is_en_passant {
        san.push_str(EN_PASSANT_SUFFIX);
    }

    san
}

/// Compact coordinate form of a move (`e2e4`, `e7e8=Q`).
pub fn coordinate_form(mv: &ChessMove) -> String {
    mv.to_string()
}

/// Decodes algebraic notation back into the legal move of `pos` it describes.
///
/// Used to re-derive a popped move during undo. Fails with
/// [`EngineError::InvalidNotation`] when the text names no legal move or
/// is ambiguous.
pub fn pgn_to_coord(notation: &str, pos: &Position) -> EngineResult<ChessMove> {
    let invalid = |reason: &str| EngineError::InvalidNotation {
        notation: notation.to_string(),
        reason: reason.to_string(),
    };

    let cleaned = notation
        .trim()
        .trim_end_matches(EN_PASSANT_SUFFIX.trim_start())
        .trim_end()
        .trim_end_matches(['+', '#', '!', '?']);

    let legal = movegen::generate_legal_moves(pos);

    let castle = match cleaned {
        "0-0" | "O-O" => Some(CastleSide::Kingside),
        "0-0-0" | "O-O-O" => Some(CastleSide::Queenside),
        _ => None,
    };
    if let Some(side) = castle {
        return legal
            .into_iter()
            .find(|m| m.castle_side() == Some(side))
            .ok_or_else(|| invalid("castling is not legal here"));
    }

    let mut body: String = cleaned.chars().filter(|&c| c != 'x' && c != ':').collect();

    // Promotion: "e8=Q" or "e8Q"
    let mut promotion = None;
    if let Some(eq) = body.find('=') {
        promotion = Some(
            PieceKind::from_promotion_letter(&body[eq + 1..])
                .ok_or_else(|| invalid("bad promotion piece"))?,
        );
        body.truncate(eq);
    } else if body.len() > 2
        && let Some(last) = body.chars().last()
        && last.is_ascii_uppercase()
    {
        promotion = Some(
            PieceKind::from_promotion_letter(&last.to_string())
                .ok_or_else(|| invalid("bad promotion piece"))?,
        );
        body.pop();
    }

    let (kind, rest) = match body.chars().next() {
        Some('K') => (PieceKind::King, &body[1..]),
        Some('Q') => (PieceKind::Queen, &body[1..]),
        Some('R') => (PieceKind::Rook, &body[1..]),
        Some('B') => (PieceKind::Bishop, &body[1..]),
        Some('N') => (PieceKind::Knight, &body[1..]),
        Some(_) => (PieceKind::Pawn, body.as_str()),
        None => return Err(invalid("empty notation")),
    };

    if rest.len() < 2 || !rest.is_ascii() {
        return Err(invalid("missing destination square"));
    }
    let (hint, dest) = rest.split_at(rest.len() - 2);
    let to = Square::from_algebraic(dest).ok_or_else(|| invalid("bad destination square"))?;

    let mut hint_file = None;
    let mut hint_rank = None;
    for c in hint.chars() {
        match c {
            'a'..='h' => hint_file = Some(c as u8 - b'a'),
            '1'..='8' => hint_rank = Some(c as u8 - b'1'),
            _ => return Err(invalid("bad disambiguation")),
        }
    }

    let mut candidates = legal.into_iter().filter(|m| {
        let moved = pos.board.get(m.from).map(|p| p.kind);
        let wanted_promotion = match m.promotion {
            Some(_) => Some(promotion.unwrap_or(PieceKind::Queen)),
            None => None,
        };
        moved == Some(kind)
            && m.to == to
            && m.promotion == wanted_promotion
            && !m.is_castling
            && hint_file.is_none_or(|f| m.from.file == f)
            && hint_rank.is_none_or(|r| m.from.rank == r)
    });

    match (candidates.next(), candidates.next()) {
        (Some(mv), None) => Ok(mv),
        (None, _) => Err(invalid("no legal move matches")),
        (Some(_), Some(_)) => Err(invalid("ambiguous")),
    }
}

/// Plays coordinate moves (`e2e4`, `e7e8=Q`) from the initial position and
/// returns the notation of each together with the final position.
pub fn replay<S: AsRef<str>>(moves: &[S]) -> EngineResult<(Vec<String>, Position)> {
    let mut pos = Position::starting();
    let mut notation = Vec::with_capacity(moves.len());
    for text in moves {
        let mv = movegen::parse_coordinate_move(&pos, text.as_ref())?;
        notation.push(to_algebraic(&pos, &mv));
        pos = movegen::apply_move(&pos, &mv);
    }
    Ok((notation, pos))
}
