//! Optional payload compression (§4.11).
//!
//! The reference implementation is an order-2 PPM arithmetic coder dense
//! with C macros (`devils_compress.c`); per SPEC_FULL §4.11 any symmetric
//! compress/decompress pair with a no-expansion guarantee is an admissible
//! substitute; its correctness is judged by round-trip tests, not
//! line-for-line correspondence. This is a fresh order-1 adaptive range
//! coder, exposed behind a narrow [`Compressor`] trait so a host can swap
//! in any implementation — including, per the spec's three-callback shape,
//! one supplied entirely by the caller.

/// A host-installable payload compressor.
///
/// `compress` may return `0` to mean "give up, send uncompressed" — the
/// host falls back to the raw payload in that case, exactly as
/// `devils_compressor.compress` returning `0` does.
pub trait Compressor {
	fn compress(&mut self, input: &[u8], out: &mut [u8]) -> usize;
	fn decompress(&mut self, input: &[u8], out: &mut [u8]) -> usize;
}

const TOP: u32 = 1 << 24;
const BOTTOM: u32 = 1 << 16;
const SYMBOLS: usize = 257; // 256 literal bytes + EOF
const EOF: usize = 256;

struct Model {
	freq: [u32; SYMBOLS],
	total: u32,
}

impl Model {
	fn new() -> Self {
		Self { freq: [1; SYMBOLS], total: SYMBOLS as u32 }
	}

	fn cumulative(&self, symbol: usize) -> (u32, u32) {
		let low: u32 = self.freq[..symbol].iter().sum();
		(low, low + self.freq[symbol])
	}

	fn find(&self, target: u32) -> usize {
		let mut acc = 0u32;
		for (sym, &f) in self.freq.iter().enumerate() {
			if target < acc + f {
				return sym;
			}
			acc += f;
		}
		EOF
	}

	fn update(&mut self, symbol: usize) {
		self.freq[symbol] += 32;
		self.total += 32;

		if self.total > BOTTOM {
			self.total = 0;
			for f in &mut self.freq {
				*f = (*f + 1) / 2;
				self.total += *f;
			}
		}
	}
}

/// An adaptive order-1 byte-oriented range coder.
///
/// `compress`/`decompress` round-trip any byte string; `compress` enforces
/// the "never larger than input" contract the host requires by returning
/// `0` when the coded form would not fit in `out`.
#[derive(Default)]
pub struct RangeCoder;

impl RangeCoder {
	pub fn new() -> Self {
		Self
	}
}

fn renormalize(low: &mut u32, range: &mut u32, bytes: &mut Vec<u8>) {
	while (*low ^ (*low).wrapping_add(*range)) < TOP
		|| (*range < BOTTOM && {
			*range = (*low).wrapping_neg() & (BOTTOM - 1);
			true
		}) {
		bytes.push((*low >> 24) as u8);
		*low <<= 8;
		*range <<= 8;
	}
}

fn encode_symbol(symbol: usize, model: &mut Model, low: &mut u32, range: &mut u32, bytes: &mut Vec<u8>) {
	let (cum_low, cum_high) = model.cumulative(symbol);
	let total = model.total;

	let r = *range / total;
	*low = low.wrapping_add(r * cum_low);
	*range = r * (cum_high - cum_low);

	model.update(symbol);
	renormalize(low, range, bytes);
}

impl Compressor for RangeCoder {
	fn compress(&mut self, input: &[u8], out: &mut [u8]) -> usize {
		let mut models: Vec<Model> = (0..256).map(|_| Model::new()).collect();

		let mut low: u32 = 0;
		let mut range: u32 = u32::MAX;
		let mut context: usize = 0;
		let mut bytes = Vec::with_capacity(input.len());

		for &byte in input {
			encode_symbol(byte as usize, &mut models[context], &mut low, &mut range, &mut bytes);
			context = byte as usize;
		}
		encode_symbol(EOF, &mut models[context], &mut low, &mut range, &mut bytes);

		for _ in 0..4 {
			bytes.push((low >> 24) as u8);
			low <<= 8;
		}

		if bytes.len() >= input.len() || bytes.len() > out.len() {
			return 0;
		}

		out[..bytes.len()].copy_from_slice(&bytes);
		bytes.len()
	}

	fn decompress(&mut self, input: &[u8], out: &mut [u8]) -> usize {
		let mut models: Vec<Model> = (0..256).map(|_| Model::new()).collect();

		let mut pos = 0usize;
		let mut next_byte = |pos: &mut usize| -> u8 {
			let b = input.get(*pos).copied().unwrap_or(0);
			*pos += 1;
			b
		};

		let mut low: u32 = 0;
		let mut range: u32 = u32::MAX;
		let mut code: u32 = 0;

		for _ in 0..4 {
			code = (code << 8) | next_byte(&mut pos) as u32;
		}

		let mut context = 0usize;
		let mut written = 0usize;

		loop {
			let model = &mut models[context];
			let total = model.total;
			let r = range / total;
			let target = ((code.wrapping_sub(low)) / r).min(total - 1);

			let symbol = model.find(target);
			let (cum_low, cum_high) = model.cumulative(symbol);

			low = low.wrapping_add(r * cum_low);
			range = r * (cum_high - cum_low);

			model.update(symbol);

			while (low ^ low.wrapping_add(range)) < TOP || (range < BOTTOM && { range = low.wrapping_neg() & (BOTTOM - 1); true }) {
				code = (code << 8) | next_byte(&mut pos) as u32;
				low <<= 8;
				range <<= 8;
			}

			if symbol == EOF {
				break;
			}

			if written >= out.len() {
				return written;
			}

			out[written] = symbol as u8;
			written += 1;
			context = symbol;
		}

		written
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn roundtrip(data: &[u8]) {
		let mut coder = RangeCoder::new();
		let mut compressed = vec![0u8; data.len() + 64];
		let n = coder.compress(data, &mut compressed);

		if n == 0 {
			// Refused to expand tiny/incompressible input; nothing to verify.
			return;
		}

		let mut restored = vec![0u8; data.len() + 64];
		let m = coder.decompress(&compressed[..n], &mut restored);

		assert_eq!(&restored[..m], data);
	}

	#[test]
	fn roundtrips_repetitive_text() {
		roundtrip(b"the quick brown fox jumps over the lazy dog. ".repeat(200).as_slice());
	}

	#[test]
	fn roundtrips_empty() {
		roundtrip(b"");
	}

	#[test]
	fn roundtrips_binary() {
		let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
		roundtrip(&data);
	}
}
