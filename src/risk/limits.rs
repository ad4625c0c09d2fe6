//! Exposure limits across the open position table.

/// Structural limits on how many positions may be open at once.
#[derive(Debug, Clone)]
pub struct ExposureLimits {
    max_open_positions: usize,
    primary_symbol: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExposureBlock {
    #[error("position already open for symbol")]
    SymbolAlreadyOpen,
    #[error("primary symbol position already open")]
    PrimaryAlreadyOpen,
    #[error("{open} of {max} positions open")]
    MaxOpenPositions { open: usize, max: usize },
}

impl ExposureLimits {
    pub fn new(max_open_positions: usize, primary_symbol: Option<String>) -> Self {
        Self {
            max_open_positions,
            primary_symbol,
        }
    }

    /// Check whether `symbol` may open given the symbols currently open.
    pub fn check<'a, I>(&self, symbol: &str, open_symbols: I) -> Result<(), ExposureBlock>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut open = 0;
        for existing in open_symbols {
            if existing == symbol {
                return Err(if self.is_primary(symbol) {
                    ExposureBlock::PrimaryAlreadyOpen
                } else {
                    ExposureBlock::SymbolAlreadyOpen
                });
            }
            open += 1;
        }
        if open >= self.max_open_positions {
            return Err(ExposureBlock::MaxOpenPositions {
                open,
                max: self.max_open_positions,
            });
        }
        Ok(())
    }

    pub fn is_primary(&self, symbol: &str) -> bool {
        self.primary_symbol.as_deref() == Some(symbol)
    }
}
