//! Core types for the duplex chess server.
//!
//! This module defines the fundamental data structures shared by the rules
//! engine and the session layer: colors, pieces, squares (including the
//! row/column mapping used on the wire), the board grid, castling rights,
//! moves and game results.

use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

// ---------------------------------------------------------------------------
// Piece & Color
// ---------------------------------------------------------------------------

/// Represents the color (side) of a chess piece or player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    /// The White side (starts on ranks 1–2).
    White,
    /// The Black side (starts on ranks 7–8).
    Black,
}

impl Color {
    /// Returns the opposite color.
    pub fn opponent(self) -> Color {
        match self {
            Color::White => Color::Black,
            Color::Black => Color::White,
        }
    }

    /// Returns the home rank index (0-based) for pawns of this color.
    /// White pawns start on rank 2 (index 1), Black on rank 7 (index 6).
    pub fn pawn_start_rank(self) -> u8 {
        match self {
            Color::White => 1,
            Color::Black => 6,
        }
    }

    /// Returns the promotion rank index (0-based).
    /// White promotes on rank 8 (index 7), Black on rank 1 (index 0).
    pub fn promotion_rank(self) -> u8 {
        match self {
            Color::White => 7,
            Color::Black => 0,
        }
    }

    /// Returns the direction pawns move: +1 for White, -1 for Black.
    pub fn pawn_direction(self) -> i8 {
        match self {
            Color::White => 1,
            Color::Black => -1,
        }
    }

    /// Back rank index of this side (where king and rooks start).
    pub fn back_rank(self) -> u8 {
        match self {
            Color::White => 0,
            Color::Black => 7,
        }
    }

    /// FEN side-to-move letter.
    pub fn fen_char(self) -> char {
        match self {
            Color::White => 'w',
            Color::Black => 'b',
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::White => write!(f, "white"),
            Color::Black => write!(f, "black"),
        }
    }
}

/// Represents a chess piece type (without color information).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub enum PieceKind {
    King,
    Queen,
    Rook,
    Bishop,
    Knight,
    Pawn,
}

impl PieceKind {
    /// Uppercase letter used in algebraic notation and FEN.
    pub fn letter(self) -> char {
        match self {
            PieceKind::King => 'K',
            PieceKind::Queen => 'Q',
            PieceKind::Rook => 'R',
            PieceKind::Bishop => 'B',
            PieceKind::Knight => 'N',
            PieceKind::Pawn => 'P',
        }
    }

    /// Parses a promotion choice (`Q`, `R`, `B`, `N`, case-insensitive).
    /// Kings and pawns are never valid promotion targets.
    pub fn from_promotion_letter(s: &str) -> Option<PieceKind> {
        match s.trim().to_ascii_uppercase().as_str() {
            "Q" => Some(PieceKind::Queen),
            "R" => Some(PieceKind::Rook),
            "B" => Some(PieceKind::Bishop),
            "N" => Some(PieceKind::Knight),
            _ => None,
        }
    }

    /// Whether a pawn may promote to this kind.
    pub fn is_promotion_target(self) -> bool {
        matches!(
            self,
            PieceKind::Queen | PieceKind::Rook | PieceKind::Bishop | PieceKind::Knight
        )
    }
}

/// A chess piece with both kind and color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Piece {
    pub kind: PieceKind,
    pub color: Color,
}

impl Piece {
    /// Creates a new piece.
    pub fn new(kind: PieceKind, color: Color) -> Self {
        Self { kind, color }
    }

    /// Converts the piece to its FEN character representation.
    /// Uppercase for White, lowercase for Black.
    pub fn to_fen_char(self) -> char {
        let c = self.kind.letter();
        match self.color {
            Color::White => c,
            Color::Black => c.to_ascii_lowercase(),
        }
    }

    /// Parses a FEN character into a `Piece`.
    /// Returns `None` if the character is not a valid piece symbol.
    pub fn from_fen_char(c: char) -> Option<Self> {
        let color = if c.is_uppercase() {
            Color::White
        } else {
            Color::Black
        };
        let kind = match c.to_ascii_uppercase() {
            'K' => PieceKind::King,
            'Q' => PieceKind::Queen,
            'R' => PieceKind::Rook,
            'B' => PieceKind::Bishop,
            'N' => PieceKind::Knight,
            'P' => PieceKind::Pawn,
            _ => return None,
        };
        Some(Piece { kind, color })
    }
}

// ---------------------------------------------------------------------------
// Square
// ---------------------------------------------------------------------------

/// Represents a square on the chessboard using 0-based file and rank indices.
///
/// - `file`: 0 (a) to 7 (h)
/// - `rank`: 0 (rank 1) to 7 (rank 8)
///
/// Clients address squares as `(i, j)` row/column pairs where row 0 is
/// rank 8 and column 0 is file a; see [`Square::from_coords`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Square {
    pub file: u8,
    pub rank: u8,
}

impl Square {
    /// Creates a new square from 0-based file and rank.
    pub fn new(file: u8, rank: u8) -> Self {
        debug_assert!(file < 8 && rank < 8, "Square out of bounds");
        Self { file, rank }
    }

    /// Converts a wire `(row, column)` pair into a square.
    /// Returns `None` when either index is off the board.
    pub fn from_coords(i: u8, j: u8) -> Option<Self> {
        if i < 8 && j < 8 {
            Some(Square::new(j, 7 - i))
        } else {
            None
        }
    }

    /// Converts the square back to the wire `(row, column)` pair.
    pub fn to_coords(self) -> (u8, u8) {
        (7 - self.rank, self.file)
    }

    /// Parses an algebraic notation string (e.g. "e4") into a `Square`.
    /// Returns `None` for invalid input.
    pub fn from_algebraic(s: &str) -> Option<Self> {
        let bytes = s.as_bytes();
        if bytes.len() != 2 {
            return None;
        }
        let file = bytes[0].wrapping_sub(b'a');
        let rank = bytes[1].wrapping_sub(b'1');
        if file < 8 && rank < 8 {
            Some(Square { file, rank })
        } else {
            None
        }
    }

    /// Converts the square to its algebraic notation string (e.g. "e4").
    pub fn to_algebraic(self) -> String {
        format!("{}{}", self.file_char(), self.rank + 1)
    }

    /// File letter (`a`..`h`).
    pub fn file_char(self) -> char {
        (b'a' + self.file) as char
    }

    /// Rank digit (`1`..`8`).
    pub fn rank_char(self) -> char {
        (b'1' + self.rank) as char
    }

    /// Returns a new square offset by `(df, dr)`, or `None` if out of bounds.
    pub fn offset(self, df: i8, dr: i8) -> Option<Square> {
        let f = self.file as i8 + df;
        let r = self.rank as i8 + dr;
        if (0..8).contains(&f) && (0..8).contains(&r) {
            Some(Square::new(f as u8, r as u8))
        } else {
            None
        }
    }

    /// Returns a flat index (0..63) for the square.
    pub fn index(self) -> usize {
        (self.rank as usize) * 8 + self.file as usize
    }

    /// `true` for light squares (h1 is light).
    pub fn is_light(self) -> bool {
        (self.file + self.rank) % 2 == 1
    }

    /// Iterates over all 64 squares, a1 first.
    pub fn all() -> impl Iterator<Item = Square> {
        (0..8u8).flat_map(|rank| (0..8u8).map(move |file| Square::new(file, rank)))
    }
}

impl fmt::Display for Square {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_algebraic())
    }
}

// ---------------------------------------------------------------------------
// Castling Rights
// ---------------------------------------------------------------------------

/// Castling rights for one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct SideCastlingRights {
    /// Whether kingside castling (short castling) is still available.
    pub kingside: bool,
    /// Whether queenside castling (long castling) is still available.
    pub queenside: bool,
}

impl Default for SideCastlingRights {
    fn default() -> Self {
        Self {
            kingside: true,
            queenside: true,
        }
    }
}

impl SideCastlingRights {
    /// No castling in either direction.
    pub fn none() -> Self {
        Self {
            kingside: false,
            queenside: false,
        }
    }
}

/// Castling rights for both sides.
///
/// These double as the "has ever moved" record for kings and rooks: a right
/// is lost permanently the first time the king or the matching rook leaves
/// its home square (or the rook is captured there).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
pub struct CastlingRights {
    pub white: SideCastlingRights,
    pub black: SideCastlingRights,
}

impl CastlingRights {
    /// No castling rights for anyone.
    pub fn none() -> Self {
        Self {
            white: SideCastlingRights::none(),
            black: SideCastlingRights::none(),
        }
    }

    /// Returns the castling rights for the given color.
    pub fn for_color(&self, color: Color) -> &SideCastlingRights {
        match color {
            Color::White => &self.white,
            Color::Black => &self.black,
        }
    }

    /// Returns a mutable reference to the castling rights for the given color.
    pub fn for_color_mut(&mut self, color: Color) -> &mut SideCastlingRights {
        match color {
            Color::White => &mut self.white,
            Color::Black => &mut self.black,
        }
    }

    /// Generates the FEN castling string (e.g. "KQkq" or "-").
    pub fn to_fen(&self) -> String {
        let mut s = String::new();
        if self.white.kingside {
            s.push('K');
        }
        if self.white.queenside {
            s.push('Q');
        }
        if self.black.kingside {
            s.push('k');
        }
        if self.black.queenside {
            s.push('q');
        }
        if s.is_empty() {
            "-".to_string()
        } else {
            s
        }
    }

    /// Parses a FEN castling field.
    pub fn from_fen(field: &str) -> Option<Self> {
        let mut rights = CastlingRights::none();
        if field == "-" {
            return Some(rights);
        }
        for c in field.chars() {
            match c {
                'K' => rights.white.kingside = true,
                'Q' => rights.white.queenside = true,
                'k' => rights.black.kingside = true,
                'q' => rights.black.queenside = true,
                _ => return None,
            }
        }
        Some(rights)
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// Represents the chess board as a flat 64-element array.
///
/// Each element is `Option<Piece>`; `None` means the square is empty.
/// Index mapping: `rank * 8 + file` (both 0-based).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Board {
    pub squares: [Option<Piece>; 64],
}

impl Default for Board {
    /// Returns an empty board.
    fn default() -> Self {
        Self {
            squares: [None; 64],
        }
    }
}

impl Board {
    /// Returns the piece at the given square, if any.
    pub fn get(&self, sq: Square) -> Option<Piece> {
        self.squares[sq.index()]
    }

    /// Sets (or clears) the piece at the given square.
    pub fn set(&mut self, sq: Square, piece: Option<Piece>) {
        self.squares[sq.index()] = piece;
    }

    /// Creates the standard starting position.
    pub fn starting_position() -> Self {
        let mut board = Board::default();

        let back_row = [
            PieceKind::Rook,
            PieceKind::Knight,
            PieceKind::Bishop,
            PieceKind::Queen,
            PieceKind::King,
            PieceKind::Bishop,
            PieceKind::Knight,
            PieceKind::Rook,
        ];

        for (file, kind) in back_row.into_iter().enumerate() {
            let file = file as u8;
            board.set(Square::new(file, 0), Some(Piece::new(kind, Color::White)));
            board.set(Square::new(file, 1), Some(Piece::new(PieceKind::Pawn, Color::White)));
            board.set(Square::new(file, 6), Some(Piece::new(PieceKind::Pawn, Color::Black)));
            board.set(Square::new(file, 7), Some(Piece::new(kind, Color::Black)));
        }

        board
    }

    /// Iterates over every occupied square and its piece.
    pub fn pieces(&self) -> impl Iterator<Item = (Square, Piece)> + '_ {
        Square::all().filter_map(|sq| self.get(sq).map(|p| (sq, p)))
    }

    /// Finds the king square for the given color.
    /// Returns `None` if the king is not on the board. (Should never happen in a legal game.)
    pub fn find_king(&self, color: Color) -> Option<Square> {
        self.pieces()
            .find(|(_, p)| p.kind == PieceKind::King && p.color == color)
            .map(|(sq, _)| sq)
    }

    /// FEN piece-placement field (rank 8 first).
    pub fn placement_fen(&self) -> String {
        let mut fen = String::new();
        for rank in (0..8).rev() {
            let mut empty_count = 0;
            for file in 0..8u8 {
                let sq = Square::new(file, rank);
                match self.get(sq) {
                    Some(piece) => {
                        if empty_count > 0 {
                            fen.push_str(&empty_count.to_string());
                            empty_count = 0;
                        }
                        fen.push(piece.to_fen_char());
                    }
                    None => {
                        empty_count += 1;
                    }
                }
            }
            if empty_count > 0 {
                fen.push_str(&empty_count.to_string());
            }
            if rank > 0 {
                fen.push('/');
            }
        }
        fen
    }

    /// Parses a FEN piece-placement field.
    pub fn from_placement_fen(field: &str) -> Result<Self, String> {
        let rows: Vec<&str> = field.split('/').collect();
        if rows.len() != 8 {
            return Err(format!("expected 8 ranks, found {}", rows.len()));
        }
        let mut board = Board::default();
        for (row, text) in rows.iter().enumerate() {
            let rank = 7 - row as u8;
            let mut file = 0u8;
            for c in text.chars() {
                if let Some(skip) = c.to_digit(10) {
                    if skip == 0 || skip > 8 {
                        return Err(format!("invalid empty-run '{}' on rank {}", c, rank + 1));
                    }
                    file += skip as u8;
                } else {
                    let piece = Piece::from_fen_char(c)
                        .ok_or_else(|| format!("invalid piece symbol '{}'", c))?;
                    if file >= 8 {
                        return Err(format!("rank {} overflows", rank + 1));
                    }
                    board.set(Square::new(file, rank), Some(piece));
                    file += 1;
                }
                if file > 8 {
                    return Err(format!("rank {} overflows", rank + 1));
                }
            }
            if file != 8 {
                return Err(format!("rank {} has {} files", rank + 1, file));
            }
        }
        Ok(board)
    }
}

// ---------------------------------------------------------------------------
// Game result
// ---------------------------------------------------------------------------

/// The result of a completed game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum GameResult {
    /// White wins (e.g. by checkmate or Black resignation).
    WhiteWins,
    /// Black wins (e.g. by checkmate or White resignation).
    BlackWins,
    /// The game is a draw.
    Draw,
}

impl GameResult {
    /// A win for the given color.
    pub fn win_for(color: Color) -> Self {
        match color {
            Color::White => GameResult::WhiteWins,
            Color::Black => GameResult::BlackWins,
        }
    }

    /// Short result code sent to clients.
    pub fn code(self) -> &'static str {
        match self {
            GameResult::WhiteWins => "1-0",
            GameResult::BlackWins => "0-1",
            GameResult::Draw => "1/2-1/2",
        }
    }
}

impl fmt::Display for GameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameResult::WhiteWins => write!(f, "1-0 (White wins)"),
            GameResult::BlackWins => write!(f, "0-1 (Black wins)"),
            GameResult::Draw => write!(f, "1/2-1/2 (Draw)"),
        }
    }
}

/// The reason a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "kebab-case")]
pub enum GameEndReason {
    Checkmate,
    Stalemate,
    InsufficientMaterial,
    SeventyFiveMove,
    Fivefold,
    FiftyMove,
    Threefold,
    Agreement,
    Resignation,
    Timeout,
}

impl GameEndReason {
    /// Reason code sent to clients.
    pub fn code(self) -> &'static str {
        match self {
            GameEndReason::Checkmate => "checkmate",
            GameEndReason::Stalemate => "stalemate",
            GameEndReason::InsufficientMaterial => "insufficient-material",
            GameEndReason::SeventyFiveMove => "seventy-five-move",
            GameEndReason::Fivefold => "fivefold",
            GameEndReason::FiftyMove => "fifty-move",
            GameEndReason::Threefold => "threefold",
            GameEndReason::Agreement => "agreement",
            GameEndReason::Resignation => "resignation",
            GameEndReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for GameEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GameEndReason::Checkmate => write!(f, "Checkmate"),
            GameEndReason::Stalemate => write!(f, "Stalemate"),
            GameEndReason::InsufficientMaterial => write!(f, "Insufficient material"),
            GameEndReason::SeventyFiveMove => write!(f, "75-move rule"),
            GameEndReason::Fivefold => write!(f, "Fivefold repetition"),
            GameEndReason::FiftyMove => write!(f, "50-move rule"),
            GameEndReason::Threefold => write!(f, "Threefold repetition"),
            GameEndReason::Agreement => write!(f, "Draw by agreement"),
            GameEndReason::Resignation => write!(f, "Resignation"),
            GameEndReason::Timeout => write!(f, "Timeout"),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal move representation
// ---------------------------------------------------------------------------

/// Which way a king castled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastleSide {
    Kingside,
    Queenside,
}

/// Internal representation of a chess move (used by the engine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChessMove {
    pub from: Square,
    pub to: Square,
    pub promotion: Option<PieceKind>,
    pub is_castling: bool,
    pub is_en_passant: bool,
}

impl ChessMove {
    /// Creates a simple move (no promotion, no castling, no en passant).
    pub fn simple(from: Square, to: Square) -> Self {
        Self {
            from,
            to,
            promotion: None,
            is_castling: false,
            is_en_passant: false,
        }
    }

    /// Castling direction, derived from the king's horizontal travel.
    pub fn castle_side(&self) -> Option<CastleSide> {
        if !self.is_castling {
            None
        } else if self.to.file > self.from.file {
            Some(CastleSide::Kingside)
        } else {
            Some(CastleSide::Queenside)
        }
    }
}

/// Compact coordinate form (`e2e4`, `e7e8=Q`), free of any disambiguation.
impl fmt::Display for ChessMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.from.to_algebraic(), self.to.to_algebraic())?;
        if let Some(promo) = self.promotion {
            write!(f, "={}", promo.letter())?;
        }
        Ok(())
    }
}
