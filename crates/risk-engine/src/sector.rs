/// GICS-like sector mapping for concentration checks, covering the most
/// commonly traded US symbols. Unknown symbols land in "Other", which still
/// participates in the concentration cap.
pub fn symbol_to_sector(symbol: &str) -> &'static str {
    match symbol {
        "AAPL" | "MSFT" | "GOOGL" | "GOOG" | "META" | "NVDA" | "AMD" | "INTC" | "CRM"
        | "ORCL" | "ADBE" | "CSCO" | "AVGO" | "TXN" | "QCOM" | "NOW" | "IBM" | "AMAT"
        | "MU" | "LRCX" | "KLAC" | "SNPS" | "CDNS" | "MRVL" | "PANW" | "FTNT" | "CRWD" => {
            "Technology"
        }
        "AMZN" | "TSLA" | "HD" | "NKE" | "SBUX" | "TGT" | "LOW" | "MCD" | "BKNG" | "CMG"
        | "ABNB" | "LULU" | "ROST" | "TJX" | "ORLY" | "AZO" | "DPZ" => "Consumer Discretionary",
        "NFLX" | "DIS" | "CMCSA" | "T" | "VZ" | "TMUS" | "SPOT" | "ROKU" | "SNAP" | "PINS" => {
            "Communication"
        }
        "JPM" | "BAC" | "WFC" | "GS" | "MS" | "C" | "BLK" | "SCHW" | "AXP" | "V" | "MA"
        | "BRK.B" | "COF" | "USB" | "PNC" | "TFC" => "Financials",
        "JNJ" | "UNH" | "PFE" | "ABBV" | "MRK" | "LLY" | "TMO" | "ABT" | "DHR" | "BMY"
        | "AMGN" | "GILD" | "ISRG" | "MDT" | "SYK" | "CI" | "HUM" | "MRNA" | "BIIB" => {
            "Healthcare"
        }
        "PG" | "KO" | "PEP" | "WMT" | "COST" | "PM" | "MO" | "CL" | "KHC" | "MDLZ" | "STZ"
        | "KMB" => "Consumer Staples",
        "XOM" | "CVX" | "COP" | "SLB" | "EOG" | "MPC" | "PSX" | "VLO" | "OXY" | "HAL" => {
            "Energy"
        }
        "BA" | "CAT" | "HON" | "UPS" | "RTX" | "GE" | "LMT" | "DE" | "MMM" | "UNP" | "FDX"
        | "WM" | "ETN" | "ITW" | "EMR" => "Industrials",
        // ETFs get their own bucket so index hedges don't collide with
        // single-name sector exposure.
        "SPY" | "QQQ" | "DIA" | "IWM" | "VTI" | "VOO" | "XLF" | "XLK" | "XLE" | "XLV"
        | "XLI" | "XLU" | "XLP" | "XLY" | "XLB" | "XLRE" | "XLC" | "GLD" | "TLT" | "HYG"
        | "LQD" | "IEF" | "SHY" | "EEM" | "EFA" | "ARKK" => "ETFs",
        _ => "Other",
    }
}

#[cfg(test)]
mod tests {
    use super::symbol_to_sector;

    #[test]
    fn known_sectors_map() {
        assert_eq!(symbol_to_sector("AAPL"), "Technology");
        assert_eq!(symbol_to_sector("XOM"), "Energy");
        assert_eq!(symbol_to_sector("SPY"), "ETFs");
        assert_eq!(symbol_to_sector("ZZZZ"), "Other");
    }
}
