//! Immutable chess positions and the FEN exchange format.
//!
//! A [`Position`] is a plain value: applying a move produces a new one
//! (see [`crate::movegen::apply_move`]) and the previous value is never
//! touched, so sessions can keep one snapshot per ply without aliasing.
//!
//! Move-history facts the rules need are carried by the position itself:
//! castling rights record whether kings and rooks have moved, and the
//! en passant target records which pawn has just advanced two squares.

use crate::error::{EngineError, EngineResult};
use crate::movegen;
use crate::types::*;

/// FEN of the standard starting position.
pub const START_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// A full board position plus the side to move and the move counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Piece placement.
    pub board: Board,
    /// Side to move.
    pub turn: Color,
    /// Castling rights.
    pub castling: CastlingRights,
    /// En passant target square (if a pawn just advanced two squares).
    pub en_passant: Option<Square>,
    /// Half-moves since the last capture or pawn move.
    pub halfmove_clock: u32,
    /// Full-move number (starts at 1, incremented after Black moves).
    pub fullmove_number: u32,
}

impl Default for Position {
    fn default() -> Self {
        Self::starting()
    }
}

impl Position {
    /// The standard starting position.
    pub fn starting() -> Self {
        Self {
            board: Board::starting_position(),
            turn: Color::White,
            castling: CastlingRights::default(),
            en_passant: None,
            halfmove_clock: 0,
            fullmove_number: 1,
        }
    }

    /// Encodes the position as a six-field FEN string.
    pub fn to_fen(&self) -> String {
        format!(
            "{} {} {}",
            self.repetition_key(),
            self.halfmove_clock,
            self.fullmove_number
        )
    }

    /// Reduced position used for repetition detection: placement, side to
    /// move, castling rights and en passant target, without the counters.
    pub fn repetition_key(&self) -> String {
        let ep = match self.en_passant {
            Some(sq) => sq.to_algebraic(),
            None => "-".to_string(),
        };
        format!(
            "{} {} {} {}",
            self.board.placement_fen(),
            self.turn.fen_char(),
            self.castling.to_fen(),
            ep
        )
    }

    /// Decodes a FEN string.
    ///
    /// The two counter fields may be omitted (they default to `0 1`). The
    /// decoded position must have exactly one king per side and the side
    /// not to move must not be in check.
    pub fn from_fen(fen: &str) -> EngineResult<Self> {
        let fields: Vec<&str> = fen.split_whitespace().collect();
        if fields.len() != 4 && fields.len() != 6 {
            return Err(EngineError::InvalidFen(format!(
                "expected 4 or 6 fields, found {}",
                fields.len()
            )));
        }

        let board = Board::from_placement_fen(fields[0]).map_err(EngineError::InvalidFen)?;

        let turn = match fields[1] {
            "w" => Color::White,
            "b" => Color::Black,
            other => {
                return Err(EngineError::InvalidFen(format!(
                    "invalid side to move '{}'",
                    other
                )));
            }
        };

        let castling = CastlingRights::from_fen(fields[2]).ok_or_else(|| {
            EngineError::InvalidFen(format!("invalid castling field '{}'", fields[2]))
        })?;

        let en_passant = match fields[3] {
            "-" => None,
            s => {
                let sq = Square::from_algebraic(s).ok_or_else(|| {
                    EngineError::InvalidFen(format!("invalid en passant square '{}'", s))
                })?;
                let expected_rank = match turn {
                    Color::White => 5,
                    Color::Black => 2,
                };
                if sq.rank != expected_rank {
                    return Err(EngineError::InvalidFen(format!(
                        "en passant square {} impossible with {} to move",
                        s, turn
                    )));
                }
                Some(sq)
            }
        };

        let (halfmove_clock, fullmove_number) = if fields.len() == 6 {
            let half = fields[4].parse::<u32>().map_err(|_| {
                EngineError::InvalidFen(format!("invalid halfmove clock '{}'", fields[4]))
            })?;
            let full = fields[5].parse::<u32>().map_err(|_| {
                EngineError::InvalidFen(format!("invalid fullmove number '{}'", fields[5]))
            })?;
            if full == 0 {
                return Err(EngineError::InvalidFen("fullmove number must be >= 1".into()));
            }
            (half, full)
        } else {
            (0, 1)
        };

        for color in [Color::White, Color::Black] {
            let kings = board
                .pieces()
                .filter(|(_, p)| p.kind == PieceKind::King && p.color == color)
                .count();
            if kings != 1 {
                return Err(EngineError::InvalidFen(format!(
                    "{} has {} kings",
                    color, kings
                )));
            }
        }

        let position = Self {
            board,
            turn,
            castling,
            en_passant,
            halfmove_clock,
            fullmove_number,
        };

        if movegen::is_in_check(&position.board, turn.opponent()) {
            return Err(EngineError::InvalidFen(format!(
                "{} is in check but not to move",
                turn.opponent()
            )));
        }

        Ok(position)
    }

    /// Returns `true` if the side to move is in check.
    pub fn in_check(&self) -> bool {
        movegen::is_in_check(&self.board, self.turn)
    }
}
